use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
    time::{sleep, Duration},
};
use tracing::{info, warn};

/// Decides when the supervised process counts as ready.
///
/// Primary signal: literal substrings matched against stdout lines.
/// Fallback: polling the served URL, which covers tools whose startup
/// wording changes between versions.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    patterns: Vec<String>,
    poll_url: Option<String>,
}

impl ReadinessProbe {
    pub fn for_port(port: u16) -> Self {
        Self {
            patterns: vec!["Ready".into(), "ready".into(), format!("localhost:{port}")],
            poll_url: Some(format!("http://127.0.0.1:{port}/")),
        }
    }

    pub fn from_patterns(patterns: Vec<String>) -> Self {
        Self { patterns, poll_url: None }
    }

    pub fn matches_line(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| line.contains(p.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewStatus {
    pub running: bool,
    pub ready: bool,
    pub port: u16,
    pub url: String,
}

/// Owns at most one child process serving the generated artifact.
///
/// Replacement and shutdown always signal the previous process first, so
/// two supervised processes never run at the same instant. A process exit,
/// expected or not, returns the slot to idle and never fails the supervisor.
pub struct PreviewSupervisor {
    dir: PathBuf,
    manifest: PathBuf,
    command: String,
    port: u16,
    probe: ReadinessProbe,
    shared: Arc<Shared>,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: AtomicBool,
}

#[derive(Default)]
struct Slot {
    pid: Option<u32>,
    // Bumped on every termination; stale watcher tasks check it before touching state.
    epoch: u64,
}

impl PreviewSupervisor {
    pub fn new(dir: PathBuf, manifest: PathBuf, command: String, port: u16, probe: ReadinessProbe) -> Self {
        Self {
            dir,
            manifest,
            command,
            port,
            probe,
            shared: Arc::new(Shared { slot: Mutex::new(Slot::default()), ready: AtomicBool::new(false) }),
        }
    }

    /// Spawn (or replace) the preview process. `Ok(false)` means there is
    /// nothing servable yet and nothing was spawned.
    pub async fn start(&self) -> Result<bool> {
        if !tokio::fs::try_exists(&self.manifest).await.unwrap_or(false) {
            return Ok(false);
        }

        let mut slot = self.shared.slot.lock().await;
        terminate_slot(&mut slot, &self.shared.ready);
        let epoch = slot.epoch;

        info!("[preview] starting `{}` on port {}", self.command, self.port);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.dir)
            .env("PORT", self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn preview process")?;

        slot.pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        drop(slot);

        // Diagnostics only; stderr never affects readiness.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "preview", "{line}");
                }
            });
        }

        // The watcher owns the child: scans stdout for readiness, then reaps
        // the exit and returns the slot to idle.
        let shared = self.shared.clone();
        let probe = self.probe.clone();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "preview", "{line}");
                    if probe.matches_line(&line) {
                        let slot = shared.slot.lock().await;
                        if slot.epoch == epoch {
                            shared.ready.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }
            match child.wait().await {
                Ok(status) => info!("[preview] process exited with {status}"),
                Err(e) => warn!("[preview] wait failed: {e}"),
            }
            let mut slot = shared.slot.lock().await;
            if slot.epoch == epoch {
                slot.pid = None;
                shared.ready.store(false, Ordering::SeqCst);
            }
        });

        if let Some(url) = self.probe.poll_url.clone() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let client = reqwest::Client::new();
                loop {
                    sleep(Duration::from_secs(2)).await;
                    {
                        let slot = shared.slot.lock().await;
                        if slot.epoch != epoch || slot.pid.is_none() {
                            return;
                        }
                    }
                    if shared.ready.load(Ordering::SeqCst) {
                        return;
                    }
                    if client.get(&url).send().await.is_ok() {
                        let slot = shared.slot.lock().await;
                        if slot.epoch == epoch {
                            shared.ready.store(true, Ordering::SeqCst);
                        }
                        return;
                    }
                }
            });
        }

        Ok(true)
    }

    /// Idempotent; safe to call with nothing running.
    pub async fn stop(&self) {
        let mut slot = self.shared.slot.lock().await;
        terminate_slot(&mut slot, &self.shared.ready);
    }

    pub async fn status(&self) -> PreviewStatus {
        let slot = self.shared.slot.lock().await;
        PreviewStatus {
            running: slot.pid.is_some(),
            ready: self.shared.ready.load(Ordering::SeqCst),
            port: self.port,
            url: format!("http://localhost:{}", self.port),
        }
    }
}

fn terminate_slot(slot: &mut Slot, ready: &AtomicBool) {
    if let Some(pid) = slot.pid.take() {
        if let Err(e) = send_sigterm(pid) {
            warn!("[preview] failed to signal pid {pid}: {e}");
        }
    }
    // Outstanding watchers for the old process now fail the epoch check.
    slot.epoch += 1;
    ready.store(false, Ordering::SeqCst);
}

/// Graceful, signal-based termination; the watcher task reaps the exit.
#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("SIGTERM failed")?;
    Ok(())
}

#[cfg(windows)]
fn send_sigterm(pid: u32) -> Result<()> {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .context("taskkill failed")?;
    Ok(())
}
