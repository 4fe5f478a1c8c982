use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    /// `completed` and `error` are final; a run never leaves them.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Durable projection of the current run, written on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub vision: String,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Single-record store backing `RunMeta` across process restarts.
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn write(&self, meta: &RunMeta) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(meta)?;
        {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(&bytes).await?;
            let _ = f.sync_all().await; // best-effort
        }
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Missing or unreadable meta reads as "no run has ever been launched".
    pub async fn read(&self) -> Option<RunMeta> {
        let raw = fs::read(&self.path).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }
}
