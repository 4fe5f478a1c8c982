use std::path::PathBuf;

/// Environment-driven server configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub out_dir: PathBuf,
    pub preview_port: u16,
    pub preview_cmd: String,
    pub agent: String,
    pub agent_cmd: String,
}

impl Config {
    pub fn from_env() -> Self {
        let bind = std::env::var("APPGEN_BIND").unwrap_or_else(|_| "0.0.0.0:3001".into());
        let out_dir = PathBuf::from(std::env::var("APPGEN_OUT_DIR").unwrap_or_else(|_| "out".into()));
        let preview_port: u16 = std::env::var("APPGEN_PREVIEW_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(4000);
        let preview_cmd = std::env::var("APPGEN_PREVIEW_CMD")
            .unwrap_or_else(|_| "npm install && npx next dev -p \"$PORT\"".into());
        let agent = std::env::var("APPGEN_AGENT").unwrap_or_else(|_| "mock".into());
        let agent_cmd = std::env::var("APPGEN_AGENT_CMD").unwrap_or_else(|_| "claude".into());
        Self { bind, out_dir, preview_port, preview_cmd, agent, agent_cmd }
    }

    /// Artifact directory of the current run; replaced wholesale on each launch.
    pub fn current_dir(&self) -> PathBuf {
        self.out_dir.join("current")
    }

    pub fn meta_file(&self) -> PathBuf {
        self.current_dir().join(".meta.json")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.current_dir().join("business-summary.json")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.current_dir().join("plans")
    }

    /// Presence of this file marks the artifact as servable.
    pub fn manifest_file(&self) -> PathBuf {
        self.current_dir().join("package.json")
    }
}
