//! Configuration for a supervised tor instance.
//!
//! Loaded from TOML or built in code; immutable once handed to
//! [`Torify`](crate::Torify).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct TorifyConfig {
    /// Data directory tor is installed into and runs from.
    pub tor_dir: PathBuf,
    /// Tor binary to stage into `tor_dir`. Looked up on `PATH` when unset.
    #[serde(default)]
    pub tor_binary: Option<PathBuf>,
    /// Bridge lines (`Bridge <line>` in torrc).
    #[serde(default)]
    pub bridges: Vec<String>,
    /// Ceiling for bootstrap polling in seconds; 0 waits forever.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
    /// Ceiling for onion service publication in seconds; unset waits forever.
    #[serde(default)]
    pub publish_timeout_secs: Option<u64>,
    /// Ceiling for the control auth cookie to appear.
    #[serde(default = "default_cookie_timeout")]
    pub cookie_timeout_ms: u64,
}

fn default_bootstrap_timeout() -> u64 {
    300
}

fn default_cookie_timeout() -> u64 {
    5000
}

impl TorifyConfig {
    /// Configuration with defaults for the given data directory.
    pub fn new(tor_dir: impl Into<PathBuf>) -> Self {
        Self {
            tor_dir: tor_dir.into(),
            tor_binary: None,
            bridges: Vec::new(),
            bootstrap_timeout_secs: default_bootstrap_timeout(),
            publish_timeout_secs: None,
            cookie_timeout_ms: default_cookie_timeout(),
        }
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: TorifyConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.tor_dir.as_os_str().is_empty() {
            return Err(Error::Config("tor_dir must not be empty".into()));
        }
        if self.cookie_timeout_ms == 0 {
            return Err(Error::Config("cookie_timeout_ms must be positive".into()));
        }
        if let Some(bridge) = self.bridges.iter().find(|b| b.trim().is_empty() || b.contains('\n')) {
            return Err(Error::Config(format!("invalid bridge line {:?}", bridge)));
        }
        Ok(())
    }

    /// Add a bridge line.
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridges.push(bridge.into());
        self
    }

    /// Use a specific tor binary.
    pub fn with_tor_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.tor_binary = Some(path.into());
        self
    }

    /// Bootstrap ceiling, `None` when unbounded.
    pub fn bootstrap_timeout(&self) -> Option<Duration> {
        match self.bootstrap_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Publication ceiling, `None` when unbounded.
    pub fn publish_timeout(&self) -> Option<Duration> {
        self.publish_timeout_secs.map(Duration::from_secs)
    }

    /// Cookie readiness ceiling.
    pub fn cookie_timeout(&self) -> Duration {
        Duration::from_millis(self.cookie_timeout_ms)
    }
}
