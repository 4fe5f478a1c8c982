use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, warn};

use crate::events::AgentEvent;

/// External build-job collaborator.
///
/// Implementations send zero or more events into `events` and eventually
/// return. A terminal `result`/`error` event before returning is not
/// guaranteed; the orchestrator covers that gap.
#[async_trait]
pub trait BuildAgent: Send + Sync {
    async fn run(&self, vision: &str, out_dir: &Path, events: mpsc::Sender<AgentEvent>) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Drives a coding-agent CLI as a subprocess and republishes its
/// stream-json output as events.
pub struct CliAgent {
    program: String,
}

impl CliAgent {
    pub fn new(program: String) -> Self {
        Self { program }
    }
}

#[async_trait]
impl BuildAgent for CliAgent {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn run(&self, vision: &str, out_dir: &Path, events: mpsc::Sender<AgentEvent>) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-p")
            .arg(vision)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn agent `{}`", self.program))?;

        let stdout = child.stdout.take().context("agent stdout not captured")?;
        let stderr = child.stderr.take();

        // Keep a tail of stderr for the failure message.
        let stderr_tail = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "agent", "{line}");
                    if tail.len() >= 20 {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            for event in parse_stream_line(&line) {
                if events.send(event).await.is_err() {
                    // Receiver gone: the run was superseded.
                    break;
                }
            }
        }

        let status = child.wait().await?;
        let tail = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            anyhow::bail!("agent exited with {}: {}", status, tail.join("\n"));
        }
        Ok(())
    }
}

/// Map one stream-json line from the agent CLI onto wire events.
/// Lines that are not valid JSON messages are skipped.
fn parse_stream_line(line: &str) -> Vec<AgentEvent> {
    let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
        debug!(target: "agent", "skipping non-json output: {line}");
        return Vec::new();
    };
    let mut out = Vec::new();
    match msg.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = msg.pointer("/message/content").and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            out.push(AgentEvent::assistant_text(text));
                        }
                    }
                    Some("tool_use") => out.push(AgentEvent::tool_use(block.clone())),
                    _ => {}
                }
            }
        }
        Some("user") => {
            let blocks = msg.pointer("/message/content").and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                    out.push(AgentEvent::tool_result(block.clone()));
                }
            }
        }
        Some("result") => {
            let content = msg
                .get("result")
                .and_then(|r| r.as_str())
                .or_else(|| msg.get("subtype").and_then(|s| s.as_str()))
                .unwrap_or("done");
            let is_error = msg.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);
            out.push(if is_error { AgentEvent::error(content) } else { AgentEvent::result(content) });
        }
        _ => {}
    }
    out
}

/// Offline stand-in that emits a plausible event stream and writes a tiny
/// servable artifact, so the whole surface works without an agent CLI.
pub struct MockAgent;

#[async_trait]
impl BuildAgent for MockAgent {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, vision: &str, out_dir: &Path, events: mpsc::Sender<AgentEvent>) -> Result<()> {
        let pkg = serde_json::json!({
            "name": "generated-app",
            "private": true,
            "scripts": { "dev": "node server.js" },
        });
        let summary = serde_json::json!({
            "vision": vision,
            "name": "Generated App",
            "tagline": "Built from a one-line vision",
        });
        let server_js = format!(
            "const http = require(\"http\");\n\
             const port = process.env.PORT || 4000;\n\
             http.createServer((req, res) => res.end(\"{}\"))\n\
               .listen(port, () => console.log(`ready on http://localhost:${{port}}`));\n",
            "Generated app placeholder"
        );

        let steps = vec![
            AgentEvent::assistant_text(format!("Scoping the build for: {vision}")),
            AgentEvent::tool_use(serde_json::json!({
                "type": "tool_use", "name": "Write", "input": { "file_path": "package.json" }
            })),
            AgentEvent::assistant_text("Writing the launch plan and summary."),
        ];
        for event in steps {
            if events.send(event).await.is_err() {
                return Ok(());
            }
            sleep(Duration::from_millis(25)).await;
        }

        tokio::fs::write(out_dir.join("package.json"), serde_json::to_vec_pretty(&pkg)?).await?;
        tokio::fs::write(out_dir.join("server.js"), server_js).await?;
        tokio::fs::write(out_dir.join("business-summary.json"), serde_json::to_vec_pretty(&summary)?).await?;
        let plans = out_dir.join("plans");
        tokio::fs::create_dir_all(&plans).await?;
        tokio::fs::write(
            plans.join("product-plan.md"),
            format!("# Product plan\n\nVision: {vision}\n"),
        )
        .await?;
        tokio::fs::write(
            plans.join("marketing-plan.md"),
            "# Marketing plan\n\nShip, then tell people.\n",
        )
        .await?;

        let _ = events
            .send(AgentEvent::tool_result(serde_json::json!({
                "type": "tool_result", "content": "wrote 5 files"
            })))
            .await;
        let _ = events.send(AgentEvent::result("Generated a runnable app skeleton")).await;
        Ok(())
    }
}
