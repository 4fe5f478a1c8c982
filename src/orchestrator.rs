use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    agent::BuildAgent,
    config::Config,
    event_log::EventLog,
    events::{now_rfc3339, AgentEvent},
    meta::{MetaStore, RunMeta, RunStatus},
    preview::PreviewSupervisor,
};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("vision is required")]
    InvalidInput,
    #[error("failed to prepare run: {0}")]
    Setup(#[from] anyhow::Error),
}

/// In-memory state of the current (or most recent) run.
pub struct Run {
    pub vision: String,
    pub started_at: String,
    pub log: EventLog,
    status: Mutex<RunStatus>,
    generation: u64,
}

impl Run {
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }
}

/// Merged durable + live view of the current run.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Single authoritative owner of "the current run".
///
/// Launching clears the previous run's artifacts and preview, drives the
/// build agent, republishes its events, persists every status transition,
/// and brings up the preview on success. All mutation funnels through here.
pub struct RunOrchestrator {
    cfg: Config,
    agent: Arc<dyn BuildAgent>,
    meta: MetaStore,
    preview: Arc<PreviewSupervisor>,
    current: Mutex<Option<Arc<Run>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl RunOrchestrator {
    pub fn new(cfg: Config, agent: Arc<dyn BuildAgent>, preview: Arc<PreviewSupervisor>) -> Self {
        let meta = MetaStore::new(cfg.meta_file());
        Self {
            cfg,
            agent,
            meta,
            preview,
            current: Mutex::new(None),
            driver: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn preview(&self) -> &PreviewSupervisor {
        &self.preview
    }

    /// Start a new run, superseding any active one. Returns as soon as the
    /// build job is dispatched; progress flows through the event log.
    pub async fn launch(self: Arc<Self>, vision: &str) -> Result<(), LaunchError> {
        let vision = vision.trim();
        if vision.is_empty() {
            return Err(LaunchError::InvalidInput);
        }

        self.preview.stop().await;

        // Supersede: the old run's subscribers get `done`, its driver is
        // aborted (a CLI agent's subprocess dies with it via kill_on_drop).
        if let Some(old) = self.current.lock().take() {
            old.log.close();
        }
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }

        let dir = self.cfg.current_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LaunchError::Setup(e.into())),
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|e| LaunchError::Setup(e.into()))?;

        let started_at = now_rfc3339();
        self.meta
            .write(&RunMeta {
                vision: vision.to_string(),
                status: RunStatus::Running,
                started_at: started_at.clone(),
                completed_at: None,
            })
            .await
            .map_err(LaunchError::Setup)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let run = Arc::new(Run {
            vision: vision.to_string(),
            started_at,
            log: EventLog::new(),
            status: Mutex::new(RunStatus::Running),
            generation,
        });
        *self.current.lock() = Some(run.clone());

        info!("launching run via `{}` agent", self.agent.name());
        let orch = Arc::clone(&self);
        let handle = tokio::spawn(async move { orch.drive(run).await });
        *self.driver.lock() = Some(handle);
        Ok(())
    }

    /// Consume the agent's event stream, then observe how its future
    /// settled. Covers agents that finish without a terminal event and
    /// agents that fail without emitting anything.
    async fn drive(self: Arc<Self>, run: Arc<Run>) {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let agent = self.agent.clone();
        let vision = run.vision.clone();
        let dir = self.cfg.current_dir();
        let job = async move { agent.run(&vision, &dir, tx).await };
        tokio::pin!(job);

        let mut settled = None;
        loop {
            tokio::select! {
                result = &mut job, if settled.is_none() => settled = Some(result),
                maybe = rx.recv() => match maybe {
                    Some(event) => self.ingest(&run, event).await,
                    None => break,
                },
            }
        }
        let settled = match settled {
            Some(result) => result,
            None => job.await, // agent dropped its sender early but is still running
        };

        match settled {
            Ok(()) => {
                if !run.status().is_terminal() {
                    self.finish(&run, RunStatus::Completed, None).await;
                }
            }
            Err(e) => {
                warn!("build agent failed: {e:#}");
                self.finish(&run, RunStatus::Error, Some(format!("{e:#}"))).await;
            }
        }
    }

    async fn ingest(&self, run: &Arc<Run>, event: AgentEvent) {
        if self.is_superseded(run) {
            return;
        }
        let terminal = event.terminal_status();
        run.log.append(event);
        if let Some(status) = terminal {
            self.finish(run, status, None).await;
        }
    }

    /// Terminal transition: persist meta, close the stream with `done`, and
    /// start the preview on success. At most once per run.
    async fn finish(&self, run: &Arc<Run>, status: RunStatus, error: Option<String>) {
        if self.is_superseded(run) {
            return;
        }
        {
            let mut current = run.status.lock();
            if current.is_terminal() {
                return;
            }
            *current = status;
        }
        if let Some(message) = error {
            run.log.append(AgentEvent::error(message));
        }

        let meta = RunMeta {
            vision: run.vision.clone(),
            status,
            started_at: run.started_at.clone(),
            completed_at: Some(now_rfc3339()),
        };
        if let Err(e) = self.meta.write(&meta).await {
            warn!("failed to persist run meta: {e:#}");
        }

        run.log.close();
        info!("run finished: {status:?}");

        if status == RunStatus::Completed {
            if let Err(e) = self.preview.start().await {
                warn!("preview failed to start: {e:#}");
            }
        }
    }

    fn is_superseded(&self, run: &Run) -> bool {
        self.generation.load(Ordering::SeqCst) != run.generation
    }

    /// Backlog snapshot plus live feed for the current run, or `None` if no
    /// run has been launched in this process lifetime.
    pub fn subscribe(&self) -> Option<(Vec<AgentEvent>, mpsc::UnboundedReceiver<AgentEvent>)> {
        let run = self.current.lock().clone()?;
        Some(run.log.subscribe())
    }

    /// Durable view merged with the live run; the in-memory status wins
    /// while a run is active, since meta writes may lag.
    pub async fn current_status(&self) -> StatusSnapshot {
        let Some(meta) = self.meta.read().await else {
            return StatusSnapshot { exists: false, ..Default::default() };
        };
        let live = self.current.lock().clone();
        StatusSnapshot {
            exists: true,
            vision: Some(meta.vision),
            status: Some(live.map(|run| run.status()).unwrap_or(meta.status)),
            started_at: Some(meta.started_at),
            completed_at: meta.completed_at,
        }
    }

    /// On boot: if the last run completed and left a servable artifact,
    /// bring the preview back up.
    pub async fn resume_preview(&self) {
        if let Some(meta) = self.meta.read().await {
            if meta.status == RunStatus::Completed {
                match self.preview.start().await {
                    Ok(true) => info!("resumed preview for completed run"),
                    Ok(false) => {}
                    Err(e) => warn!("preview failed to start: {e:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{orchestrator, ScriptedAgent};
    use std::time::Duration;

    // Terminal status *and* a persisted completedAt, so meta is on disk.
    async fn wait_terminal(orch: &RunOrchestrator) -> StatusSnapshot {
        for _ in 0..200 {
            let snapshot = orch.current_status().await;
            if matches!(snapshot.status, Some(s) if s.is_terminal()) && snapshot.completed_at.is_some() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        orch.current_status().await
    }

    async fn collect_until_done(
        backlog: Vec<AgentEvent>,
        rx: &mut mpsc::UnboundedReceiver<AgentEvent>,
    ) -> Vec<AgentEvent> {
        let mut seen = backlog;
        while let Some(event) = rx.recv().await {
            let done = matches!(event, AgentEvent::Done);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn empty_vision_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Arc::new(ScriptedAgent::default()));

        assert!(matches!(orch.clone().launch("   ").await, Err(LaunchError::InvalidInput)));
        assert!(!orch.current_status().await.exists);
        assert!(orch.subscribe().is_none());
    }

    #[tokio::test]
    async fn completed_run_reaches_subscribers_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent {
            script: vec![AgentEvent::assistant_text("building"), AgentEvent::result("shipped")],
            ..ScriptedAgent::default()
        };
        let orch = orchestrator(dir.path(), Arc::new(agent));
        orch.clone().launch("an invoice tracker").await.unwrap();

        let (backlog, mut rx) = orch.subscribe().unwrap();
        let seen = collect_until_done(backlog, &mut rx).await;
        assert!(matches!(seen.last(), Some(AgentEvent::Done)));
        assert!(seen.iter().any(|e| matches!(e, AgentEvent::Result { .. })));

        let snapshot = wait_terminal(&orch).await;
        assert_eq!(snapshot.status, Some(RunStatus::Completed));
        assert_eq!(snapshot.vision.as_deref(), Some("an invoice tracker"));
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn agent_failure_without_events_yields_one_error_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent { failure: Some("model exploded".into()), ..ScriptedAgent::default() };
        let orch = orchestrator(dir.path(), Arc::new(agent));
        orch.clone().launch("doomed").await.unwrap();

        let (backlog, mut rx) = orch.subscribe().unwrap();
        let seen = collect_until_done(backlog, &mut rx).await;
        let errors = seen.iter().filter(|e| matches!(e, AgentEvent::Error { .. })).count();
        assert_eq!(errors, 1);
        assert!(matches!(seen.last(), Some(AgentEvent::Done)));

        assert_eq!(wait_terminal(&orch).await.status, Some(RunStatus::Error));
    }

    #[tokio::test]
    async fn agent_returning_without_terminal_event_completes() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent {
            script: vec![AgentEvent::assistant_text("did work, forgot to say so")],
            ..ScriptedAgent::default()
        };
        let orch = orchestrator(dir.path(), Arc::new(agent));
        orch.clone().launch("quiet finisher").await.unwrap();

        assert_eq!(wait_terminal(&orch).await.status, Some(RunStatus::Completed));

        // The log was closed even though the agent never emitted a terminal event.
        let (backlog, mut rx) = orch.subscribe().unwrap();
        let seen = collect_until_done(backlog, &mut rx).await;
        assert!(matches!(seen.last(), Some(AgentEvent::Done)));
    }

    #[tokio::test]
    async fn relaunch_supersedes_the_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent { echo_vision: true, hang: true, ..ScriptedAgent::default() };
        let orch = orchestrator(dir.path(), Arc::new(agent));
        orch.clone().launch("first run").await.unwrap();

        let (backlog, mut rx_a) = orch.subscribe().unwrap();
        let mut first_seen = backlog;
        if first_seen.is_empty() {
            first_seen.push(rx_a.recv().await.unwrap());
        }
        assert!(matches!(&first_seen[0], AgentEvent::AssistantText { content, .. } if content == "first run"));

        // Drop a marker in the artifact dir; relaunch must wipe it.
        let marker = orch.config().current_dir().join("stale.txt");
        tokio::fs::write(&marker, b"old").await.unwrap();

        orch.clone().launch("second run").await.unwrap();

        // Old subscriber: closed with done, never sees the new run's events.
        let rest = collect_until_done(first_seen, &mut rx_a).await;
        assert!(matches!(rest.last(), Some(AgentEvent::Done)));
        assert!(!rest
            .iter()
            .any(|e| matches!(e, AgentEvent::AssistantText { content, .. } if content == "second run")));
        assert!(rx_a.recv().await.is_none());

        assert!(!tokio::fs::try_exists(&marker).await.unwrap());

        let snapshot = orch.current_status().await;
        assert_eq!(snapshot.vision.as_deref(), Some("second run"));
        assert_eq!(snapshot.status, Some(RunStatus::Running));
    }

    #[tokio::test]
    async fn status_survives_restart_via_meta_only() {
        let dir = tempfile::tempdir().unwrap();
        let script = vec![AgentEvent::result("done")];
        {
            let agent = ScriptedAgent { script: script.clone(), ..ScriptedAgent::default() };
            let orch = orchestrator(dir.path(), Arc::new(agent));
            orch.clone().launch("persisted").await.unwrap();
            wait_terminal(&orch).await;
        }

        // Fresh instance over the same directory, as after a process restart.
        let orch = orchestrator(dir.path(), Arc::new(ScriptedAgent { script, ..ScriptedAgent::default() }));
        let snapshot = orch.current_status().await;
        assert!(snapshot.exists);
        assert_eq!(snapshot.status, Some(RunStatus::Completed));
        assert_eq!(snapshot.vision.as_deref(), Some("persisted"));
        assert!(orch.subscribe().is_none());
    }
}
