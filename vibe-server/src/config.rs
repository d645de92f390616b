//! Server configuration, from flags or environment.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "vibe-server", about = "Generate static sites with an LLM and serve them on per-project subdomains")]
pub struct ServerConfig {
    /// Address for the HTTP listener
    #[arg(long, env = "VIBE_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Domain under which `<project>.<domain>` previews are served
    #[arg(long, env = "VIBE_BASE_DOMAIN", default_value = "localhost")]
    pub base_domain: String,

    /// Directory holding one subdirectory per project
    #[arg(long, env = "VIBE_APPS_DIR", default_value = "./apps")]
    pub apps_dir: PathBuf,

    /// SQLite catalog path (`:memory:` for a throwaway catalog)
    #[arg(long, env = "VIBE_DB", default_value = "./vibe.db")]
    pub db_path: PathBuf,

    /// Claude model to use
    #[arg(long, default_value = vibe_agent::llm::DEFAULT_MODEL)]
    pub model: String,

    /// Messages endpoint to stream completions from
    #[arg(long, env = "VIBE_API_URL", default_value = vibe_agent::llm::API_URL)]
    pub api_url: String,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub api_key: Option<String>,

    /// Model calls allowed per chat request
    #[arg(long, default_value_t = vibe_agent::orchestrator::DEFAULT_MAX_STEPS)]
    pub max_steps: usize,

    /// Output token budget per model call
    #[arg(long, default_value_t = 8192)]
    pub max_tokens: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            base_domain: "localhost".to_string(),
            apps_dir: PathBuf::from("./apps"),
            db_path: PathBuf::from(":memory:"),
            model: vibe_agent::llm::DEFAULT_MODEL.to_string(),
            api_url: vibe_agent::llm::API_URL.to_string(),
            api_key: None,
            max_steps: vibe_agent::orchestrator::DEFAULT_MAX_STEPS,
            max_tokens: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "vibe-server",
            "--base-domain",
            "sites.test",
            "--apps-dir",
            "/srv/apps",
            "--max-steps",
            "5",
        ])
        .unwrap();
        assert_eq!(config.base_domain, "sites.test");
        assert_eq!(config.apps_dir, PathBuf::from("/srv/apps"));
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.max_tokens, 8192);
        assert_eq!(config.api_url, vibe_agent::llm::API_URL);
    }
}
