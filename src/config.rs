//! Agent configuration.
//!
//! Loaded from an optional TOML file; command line flags override file
//! values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use kubetail_logs::DEFAULT_ENGINE_PROGRAM;

pub const DEFAULT_PORT: u16 = 50051;
const DEFAULT_LOGS_DIR: &str = "/var/log/containers";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Name of the node this agent runs on
    pub node_name: Option<String>,
    /// Directory holding the runtime's container log symlinks
    pub logs_dir: PathBuf,
    /// Line-processing engine binary
    pub engine_path: PathBuf,
    /// Upper bound for each access review
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            node_name: None,
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
            engine_path: PathBuf::from(DEFAULT_ENGINE_PROGRAM),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Command line overrides for [`AgentConfig`]
#[derive(clap::Args, Debug, Default)]
pub struct AgentOverrides {
    /// TOML config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Listen address [default: 0.0.0.0:50051]
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<SocketAddr>,

    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Container log directory
    #[arg(long, value_name = "DIR")]
    pub logs_dir: Option<PathBuf>,

    /// Line-processing engine binary
    #[arg(long, value_name = "PATH")]
    pub engine_path: Option<PathBuf>,

    /// Access review timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub request_timeout_secs: Option<u64>,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then flags
    pub fn load(overrides: &AgentOverrides) -> Result<Self> {
        let mut config = match &overrides.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &AgentOverrides) {
        if let Some(addr) = overrides.addr {
            self.addr = addr;
        }
        if let Some(node_name) = &overrides.node_name {
            self.node_name = Some(node_name.clone());
        }
        if let Some(logs_dir) = &overrides.logs_dir {
            self.logs_dir = logs_dir.clone();
        }
        if let Some(engine_path) = &overrides.engine_path {
            self.engine_path = engine_path.clone();
        }
        if let Some(secs) = overrides.request_timeout_secs {
            self.request_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if self.node_name.as_deref() == Some("") {
            bail!("node_name cannot be empty");
        }
        if self.engine_path.as_os_str().is_empty() {
            bail!("engine_path cannot be empty");
        }
        Ok(())
    }

    /// Node name, required to label log files
    pub fn node_name(&self) -> Result<&str> {
        self.node_name
            .as_deref()
            .context("node name required: set node_name in the config file or NODE_NAME")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
