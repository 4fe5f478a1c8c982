use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod agent;
mod api;
mod config;
mod event_log;
mod events;
mod meta;
mod orchestrator;
mod preview;
#[cfg(test)]
mod test_support;

use agent::{BuildAgent, CliAgent, MockAgent};
use config::Config;
use orchestrator::RunOrchestrator;
use preview::{PreviewSupervisor, ReadinessProbe};

#[derive(Parser)]
#[command(name = "appgen", about = "Supervises app-building agent runs and republishes their progress")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the HTTP API server.
    Serve,
    /// One-shot: run the build agent against the artifact directory and
    /// print its events as they stream.
    Run { vision: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();

    let agent: Arc<dyn BuildAgent> = match cfg.agent.as_str() {
        "cli" => Arc::new(CliAgent::new(cfg.agent_cmd.clone())),
        _ => Arc::new(MockAgent),
    };

    match cli.cmd {
        Cmd::Serve => {
            let preview = Arc::new(PreviewSupervisor::new(
                cfg.current_dir(),
                cfg.manifest_file(),
                cfg.preview_cmd.clone(),
                cfg.preview_port,
                ReadinessProbe::for_port(cfg.preview_port),
            ));
            let orch = Arc::new(RunOrchestrator::new(cfg.clone(), agent, preview));
            api::serve(cfg.bind, orch).await
        }
        Cmd::Run { vision } => {
            let vision = vision.join(" ");
            if vision.trim().is_empty() {
                anyhow::bail!("usage: appgen run <vision>");
            }
            let dir = cfg.current_dir();
            tokio::fs::create_dir_all(&dir).await?;
            println!("Output directory: {}", dir.display());

            let (tx, mut rx) = tokio::sync::mpsc::channel(64);
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
            });
            let result = agent.run(&vision, &dir, tx).await;
            let _ = printer.await;
            result
        }
    }
}
