use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::calculus::SncAlgorithm;

/// Top-level configuration for the admission server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listen address for the admission API. Default: ":7160".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Which SNC analysis computes per-flow latency. Default: aggregate.
    #[serde(default)]
    pub algorithm: SncAlgorithm,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    ":7160".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            algorithm: SncAlgorithm::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr is required");
        }
        Ok(())
    }
}
