use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reborn::RestartConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `tcp:<host:port>` or `unix:<path>`.
    pub listen: String,
    pub greeting: String,
    pub pid_file: Option<PathBuf>,
    /// How long in-flight connections may take to finish once we stop accepting.
    pub grace_period_secs: u64,
    pub restart: RestartConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: String::from("tcp:0.0.0.0:6188"),
            greeting: String::from("Hello, world!"),
            pid_file: None,
            grace_period_secs: 10,
            restart: RestartConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let raw =
            fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
        let config =
            serde_json::from_str(&raw).map_err(|e| format!("parsing {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
