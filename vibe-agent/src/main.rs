//! vibe-agent: run one site generation from the terminal.
//!
//! Writes into `<apps-dir>/<project>` exactly as the server would and prints
//! every wire event as a JSON line, so the output can be piped into `jq` or
//! replayed against a browser client.
//!
//!   vibe-agent --project demo1 "A landing page for a bakery"
//!
//! Requires ANTHROPIC_API_KEY environment variable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use vibe_agent::llm::{AnthropicClient, Message};
use vibe_agent::orchestrator::{self, GenerationContext, Outcome, StreamEvent};
use vibe_agent::store::ProjectFileStore;
use vibe_agent::tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "vibe-agent", about = "Generate a static site into a sandboxed project directory")]
struct Args {
    /// What to build
    prompt: String,

    /// Project id (lowercase letters and digits)
    #[arg(long)]
    project: String,

    /// Directory holding one subdirectory per project
    #[arg(long, env = "VIBE_APPS_DIR", default_value = "./apps")]
    apps_dir: PathBuf,

    /// Claude model to use
    #[arg(long, default_value = vibe_agent::llm::DEFAULT_MODEL)]
    model: String,

    /// Maximum model calls before the run is cut off
    #[arg(long, default_value_t = orchestrator::DEFAULT_MAX_STEPS)]
    max_steps: usize,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    api_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vibe_agent=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.project.is_empty()
        || !args
            .project
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        anyhow::bail!("project id must be lowercase letters and digits: {}", args.project);
    }

    tokio::fs::create_dir_all(&args.apps_dir)
        .await
        .with_context(|| format!("Failed to create {}", args.apps_dir.display()))?;

    let client = AnthropicClient::new(args.api_key.clone()).with_model(&args.model);
    let store = ProjectFileStore::for_project(&args.apps_dir, &args.project);
    let ctx = GenerationContext::new(
        args.project.clone(),
        ToolRegistry::new(store),
        vec![Message::user(args.prompt.clone())],
    )
    .with_max_steps(args.max_steps);

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!(error = %e, "Failed to encode event"),
            }
        }
    });

    let summary = orchestrator::run(&client, ctx, &tx).await;
    drop(tx);
    printer.await?;

    if summary.outcome == Outcome::Failed {
        anyhow::bail!("generation failed after {} steps", summary.steps);
    }
    tracing::info!(
        project = %args.project,
        root = %args.apps_dir.join(&args.project).display(),
        "Site written"
    );
    Ok(())
}
