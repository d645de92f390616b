//! The bounded generation loop.
//!
//! One step is one model call. Each unit the model yields becomes one wire
//! event, pushed before the next unit is pulled. Tool calls run inline, in
//! the order the model issued them, and their results are fed back for the
//! next step. The loop ends on a natural finish, on the step ceiling (still a
//! `done`), on a provider failure (`error`), or when the client goes away.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::llm::{
    CompletionClient, ContentBlock, GenerationUnit, Message, MessageContent, ProviderError,
    ToolDef, ToolResultBlock, ToolUseBlock,
};
use crate::tools::{self, ToolRegistry};

pub const DEFAULT_MAX_STEPS: usize = 20;

pub const SYSTEM_PROMPT: &str = r#"You are a web developer building a static website inside an isolated project directory.

Rules:
- Plain HTML, CSS and JavaScript only. No build step, no server code, no package managers.
- The entry page must be index.html at the project root; it is served as soon as it exists.
- Reference assets with relative paths (css/style.css, js/app.js).
- Write complete files. writeFile replaces the whole file every time.
- Keep it self-contained: no external resources unless the user asks for them.

You have these tools:
- writeFile: create or replace a file
- readFile: read a file you wrote earlier
- listFiles: see what is in the project
- deleteFile: remove a file

Work step by step: say briefly what you are going to build, write the files, then summarise what you made."#;

/// One frame of the client-facing stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool: String,
        result: Value,
    },
    Done,
    Error {
        message: String,
    },
}

/// Everything one generation run needs, built per request.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub project_id: String,
    pub registry: ToolRegistry,
    pub history: Vec<Message>,
    pub system: String,
    pub max_steps: usize,
}

impl GenerationContext {
    pub fn new(project_id: impl Into<String>, registry: ToolRegistry, history: Vec<Message>) -> Self {
        Self {
            project_id: project_id.into(),
            registry,
            history,
            system: SYSTEM_PROMPT.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The model stopped asking for tools.
    Finished,
    /// The step ceiling was hit.
    StepLimit,
    /// The provider failed; an `error` event was sent.
    Failed,
    /// The client went away.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: usize,
    pub tool_calls: usize,
    pub outcome: Outcome,
}

enum StepEnd {
    Finished,
    ToolCalls,
    Disconnected,
}

/// Drive `ctx` to a terminal state, pushing every event into `sink`.
///
/// A closed sink is the disconnect signal. It is checked before every step;
/// a tool that has already started is always allowed to finish.
pub async fn run(
    client: &dyn CompletionClient,
    mut ctx: GenerationContext,
    sink: &mpsc::Sender<StreamEvent>,
) -> RunSummary {
    let tools = ctx.registry.definitions().to_vec();
    let mut summary = RunSummary {
        steps: 0,
        tool_calls: 0,
        outcome: Outcome::StepLimit,
    };

    tracing::info!(project = %ctx.project_id, max_steps = ctx.max_steps, "Generation started");

    loop {
        if summary.steps >= ctx.max_steps {
            tracing::info!(project = %ctx.project_id, steps = summary.steps, "Step limit reached");
            summary.outcome = if emit(sink, StreamEvent::Done).await {
                Outcome::StepLimit
            } else {
                Outcome::Cancelled
            };
            break;
        }
        if sink.is_closed() {
            summary.outcome = Outcome::Cancelled;
            break;
        }

        summary.steps += 1;
        match step(client, &mut ctx, &tools, sink, &mut summary.tool_calls).await {
            Ok(StepEnd::ToolCalls) => continue,
            Ok(StepEnd::Finished) => {
                summary.outcome = if emit(sink, StreamEvent::Done).await {
                    Outcome::Finished
                } else {
                    Outcome::Cancelled
                };
                break;
            }
            Ok(StepEnd::Disconnected) => {
                summary.outcome = Outcome::Cancelled;
                break;
            }
            Err(e) => {
                tracing::warn!(project = %ctx.project_id, step = summary.steps, error = %e, "Provider failed");
                emit(
                    sink,
                    StreamEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                summary.outcome = Outcome::Failed;
                break;
            }
        }
    }

    tracing::info!(
        project = %ctx.project_id,
        steps = summary.steps,
        tool_calls = summary.tool_calls,
        outcome = ?summary.outcome,
        "Generation finished"
    );
    summary
}

async fn step(
    client: &dyn CompletionClient,
    ctx: &mut GenerationContext,
    tools: &[ToolDef],
    sink: &mpsc::Sender<StreamEvent>,
    tool_calls: &mut usize,
) -> Result<StepEnd, ProviderError> {
    let mut units = client.stream(&ctx.system, &ctx.history, tools).await?;

    let mut text = String::new();
    let mut calls: Vec<ToolUseBlock> = Vec::new();
    let mut results: Vec<ToolResultBlock> = Vec::new();

    while let Some(unit) = units.next().await {
        match unit? {
            GenerationUnit::Text(chunk) => {
                text.push_str(&chunk);
                if !emit(sink, StreamEvent::Text { content: chunk }).await {
                    return Ok(StepEnd::Disconnected);
                }
            }
            GenerationUnit::ToolCall(call) => {
                let announced = StreamEvent::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool: call.name.clone(),
                    args: call.input.clone(),
                };
                if !emit(sink, announced).await {
                    return Ok(StepEnd::Disconnected);
                }

                let result = ctx.registry.execute(&call.name, &call.input).await;
                *tool_calls += 1;
                results.push(ToolResultBlock {
                    tool_use_id: call.id.clone(),
                    content: result.to_string(),
                    is_error: (!tools::is_success(&result)).then_some(true),
                });

                let finished = StreamEvent::ToolResult {
                    tool_call_id: call.id.clone(),
                    tool: call.name.clone(),
                    result,
                };
                calls.push(call);
                if !emit(sink, finished).await {
                    return Ok(StepEnd::Disconnected);
                }
            }
            GenerationUnit::Finish(reason) => {
                tracing::debug!(project = %ctx.project_id, ?reason, "Model finished step");
            }
        }
    }

    if calls.is_empty() {
        return Ok(StepEnd::Finished);
    }

    // Assistant turn as the model produced it, then results in call order.
    let mut blocks = Vec::with_capacity(calls.len() + 1);
    if !text.trim().is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    blocks.extend(calls.into_iter().map(ContentBlock::ToolUse));
    ctx.history.push(Message {
        role: "assistant".to_string(),
        content: MessageContent::Blocks(blocks),
    });
    ctx.history.push(Message {
        role: "user".to_string(),
        content: MessageContent::Blocks(results.into_iter().map(ContentBlock::ToolResult).collect()),
    });
    Ok(StepEnd::ToolCalls)
}

/// Push one event; `false` means the client is gone.
async fn emit(sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    sink.send(event).await.is_ok()
}
