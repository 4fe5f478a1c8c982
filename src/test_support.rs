use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::BuildAgent;
use crate::config::Config;
use crate::events::AgentEvent;
use crate::orchestrator::RunOrchestrator;
use crate::preview::{PreviewSupervisor, ReadinessProbe};

/// Deterministic agent for tests: optionally echoes the vision, plays a
/// script, then settles (or hangs to simulate a long build).
#[derive(Default)]
pub struct ScriptedAgent {
    pub echo_vision: bool,
    pub script: Vec<AgentEvent>,
    pub failure: Option<String>,
    pub hang: bool,
}

#[async_trait]
impl BuildAgent for ScriptedAgent {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, vision: &str, _out_dir: &Path, events: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        if self.echo_vision {
            let _ = events.send(AgentEvent::assistant_text(vision)).await;
        }
        for event in self.script.clone() {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        match &self.failure {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        bind: "127.0.0.1:0".into(),
        out_dir: dir.to_path_buf(),
        preview_port: 4998,
        preview_cmd: "sleep 30".into(),
        agent: "scripted".into(),
        agent_cmd: String::new(),
    }
}

pub fn orchestrator(dir: &Path, agent: Arc<dyn BuildAgent>) -> Arc<RunOrchestrator> {
    let cfg = test_config(dir);
    let preview = Arc::new(PreviewSupervisor::new(
        cfg.current_dir(),
        cfg.manifest_file(),
        cfg.preview_cmd.clone(),
        cfg.preview_port,
        ReadinessProbe::from_patterns(vec!["ready".into()]),
    ));
    Arc::new(RunOrchestrator::new(cfg, agent, preview))
}
