//! Tool definitions and execution for the site-building agent.
//!
//! The model names a tool by string; we parse that into the closed
//! [`ToolCall`] set up front so nothing downstream dispatches on strings.
//! Every execution, success or failure, comes back as a JSON envelope that is
//! shown to the client and fed back to the model.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::llm::ToolDef;
use crate::store::{ProjectFileStore, StoreError};

pub const WRITE_FILE: &str = "writeFile";
pub const READ_FILE: &str = "readFile";
pub const LIST_FILES: &str = "listFiles";
pub const DELETE_FILE: &str = "deleteFile";

/// A parsed, typed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    WriteFile { path: String, content: String },
    ReadFile { path: String },
    ListFiles { directory: Option<String> },
    DeleteFile { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: &'static str, reason: String },
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct PathArgs {
    #[serde(alias = "filePath")]
    path: String,
}

#[derive(Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    directory: Option<String>,
}

fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &'static str,
    args: &Value,
) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::InvalidArgs {
        tool,
        reason: e.to_string(),
    })
}

impl ToolCall {
    /// Parse a model-issued `(name, args)` pair.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        match name {
            WRITE_FILE => {
                let a: WriteFileArgs = parse_args(WRITE_FILE, args)?;
                Ok(ToolCall::WriteFile {
                    path: a.path,
                    content: a.content,
                })
            }
            READ_FILE => {
                let a: PathArgs = parse_args(READ_FILE, args)?;
                Ok(ToolCall::ReadFile { path: a.path })
            }
            LIST_FILES => {
                let a: ListFilesArgs = parse_args(LIST_FILES, args)?;
                Ok(ToolCall::ListFiles {
                    directory: a.directory.filter(|d| !d.is_empty()),
                })
            }
            DELETE_FILE => {
                let a: PathArgs = parse_args(DELETE_FILE, args)?;
                Ok(ToolCall::DeleteFile { path: a.path })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::WriteFile { .. } => WRITE_FILE,
            ToolCall::ReadFile { .. } => READ_FILE,
            ToolCall::ListFiles { .. } => LIST_FILES,
            ToolCall::DeleteFile { .. } => DELETE_FILE,
        }
    }

    /// The path this call will be sandboxed against.
    fn target(&self) -> &str {
        match self {
            ToolCall::WriteFile { path, .. }
            | ToolCall::ReadFile { path }
            | ToolCall::DeleteFile { path } => path,
            ToolCall::ListFiles { directory } => directory.as_deref().unwrap_or(""),
        }
    }
}

/// `{success: false, error}`.
pub fn failure(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

/// Whether an envelope reports success.
pub fn is_success(envelope: &Value) -> bool {
    envelope["success"].as_bool().unwrap_or(false)
}

/// The four file tools, bound to one tenant's store.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    store: ProjectFileStore,
    definitions: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new(store: ProjectFileStore) -> Self {
        Self {
            store,
            definitions: definitions(),
        }
    }

    pub fn store(&self) -> &ProjectFileStore {
        &self.store
    }

    /// Schemas offered to the model.
    pub fn definitions(&self) -> &[ToolDef] {
        &self.definitions
    }

    /// Parse and run one model-issued call. Never fails: problems come back
    /// as a failure envelope.
    pub async fn execute(&self, name: &str, args: &Value) -> Value {
        match ToolCall::parse(name, args) {
            Ok(call) => self.run(call).await,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Rejected tool call");
                failure(e)
            }
        }
    }

    pub async fn run(&self, call: ToolCall) -> Value {
        // Validate before the lazy root creation so a bad path leaves no trace.
        if let Err(violation) = self.store.resolve(call.target()) {
            tracing::warn!(
                tool = call.name(),
                root = %self.store.root().display(),
                error = %violation,
                "Sandbox violation"
            );
            return failure(violation);
        }
        if let Err(e) = self.store.ensure_root().await {
            return failure(e);
        }

        let result = match &call {
            ToolCall::WriteFile { path, content } => {
                self.store.write(path, content).await.map(|()| {
                    json!({
                        "success": true,
                        "path": path,
                        "message": format!("Wrote {path} ({} bytes)", content.len()),
                    })
                })
            }
            ToolCall::ReadFile { path } => self.store.read(path).await.map(|content| {
                json!({ "success": true, "path": path, "content": content })
            }),
            ToolCall::ListFiles { directory } => self
                .store
                .list(directory.as_deref())
                .await
                .map(|files| json!({ "success": true, "files": files })),
            ToolCall::DeleteFile { path } => self.store.delete(path).await.map(|()| {
                json!({ "success": true, "message": format!("Deleted {path}") })
            }),
        };

        match result {
            Ok(envelope) => {
                tracing::debug!(tool = call.name(), target = call.target(), "Tool succeeded");
                envelope
            }
            Err(e) => {
                if matches!(e, StoreError::Io { .. } | StoreError::Join(_)) {
                    tracing::warn!(tool = call.name(), error = %e, "Tool failed");
                }
                failure(e)
            }
        }
    }
}

/// Tool definitions for the site-building agent.
pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: WRITE_FILE.to_string(),
            description: "Create or overwrite a file in the project. Use it for HTML, CSS, JavaScript and other static assets. Creates directories as needed."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["path", "content"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the project root, e.g. 'index.html' or 'css/style.css'"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full file content"
                    }
                }
            }),
        },
        ToolDef {
            name: READ_FILE.to_string(),
            description: "Read a file from the project.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the project root"
                    }
                }
            }),
        },
        ToolDef {
            name: LIST_FILES.to_string(),
            description: "List every file in the project, or under one subdirectory.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "Subdirectory to list; defaults to the project root"
                    }
                }
            }),
        },
        ToolDef {
            name: DELETE_FILE.to_string(),
            description: "Delete a file from the project.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the project root"
                    }
                }
            }),
        },
    ]
}
