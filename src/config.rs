use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HerdError, Result};

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8400";
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:8401";

fn default_name(role: &str) -> Result<String> {
    let hostname = nix::unistd::gethostname()
        .map_err(|e| HerdError::Config(format!("no name provided and hostname unavailable: {e}")))?;
    Ok(format!("taskherd.{role}.{}", hostname.to_string_lossy()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| HerdError::Config(format!("{}: {e}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Administrative HTTP API
    pub http: String,
    /// Agent connections
    pub tcp: String,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            http: DEFAULT_HTTP_ADDR.to_string(),
            tcp: DEFAULT_TCP_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSchedulerConfig {
    pub interval_ms: u64,
    /// How long an unanswered offer blocks re-offering its job.
    pub offer_timeout_ms: u64,
}

impl Default for ControllerSchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            offer_timeout_ms: 10_000,
        }
    }
}

impl ControllerSchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    pub addresses: AddressConfig,
    /// Job logs live under `<data_dir>/logs`.
    pub data_dir: PathBuf,
    pub scheduler: ControllerSchedulerConfig,
}

impl ControllerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json::<Self>(path.as_ref())?.finalize()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str::<Self>(raw)
            .map_err(|e| HerdError::Config(e.to_string()))?
            .finalize()
    }

    fn finalize(mut self) -> Result<Self> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(HerdError::Config("no data_dir specified".to_string()));
        }
        if self.addresses.http.is_empty() {
            self.addresses.http = DEFAULT_HTTP_ADDR.to_string();
        }
        if self.addresses.tcp.is_empty() {
            self.addresses.tcp = DEFAULT_TCP_ADDR.to_string();
        }
        if self.name.is_empty() {
            self.name = default_name("controller")?;
        }
        Ok(self)
    }

    /// Local single-machine setup used by `taskherd dev`.
    pub fn dev() -> Result<Self> {
        Self {
            data_dir: PathBuf::from(".taskherd-dev"),
            ..Default::default()
        }
        .finalize()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSchedulerConfig {
    /// Jobs run concurrently; 0 is treated as 1.
    pub max_parallel_jobs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvidiaConfig {
    pub enabled: bool,
    pub nvidia_smi: String,
    pub poll_ms: u64,
}

impl Default for NvidiaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nvidia_smi: "nvidia-smi".to_string(),
            poll_ms: 1000,
        }
    }
}

impl NvidiaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(100))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Controller address, `host:port`.
    pub cluster: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub scheduler: AgentSchedulerConfig,
    pub nvidia: NvidiaConfig,
    /// Delay between reconnection attempts; 0 exits after the first session.
    pub reconnect_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster: String::new(),
            name: String::new(),
            capabilities: Vec::new(),
            scheduler: AgentSchedulerConfig::default(),
            nvidia: NvidiaConfig::default(),
            reconnect_ms: 5000,
        }
    }
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json::<Self>(path.as_ref())?.finalize()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str::<Self>(raw)
            .map_err(|e| HerdError::Config(e.to_string()))?
            .finalize()
    }

    fn finalize(mut self) -> Result<Self> {
        if self.cluster.is_empty() {
            return Err(HerdError::Config("no cluster address found in config".to_string()));
        }
        if self.name.is_empty() {
            self.name = default_name("agent")?;
        }
        if self.scheduler.max_parallel_jobs == 0 {
            self.scheduler.max_parallel_jobs = 1;
        }
        Ok(self)
    }

    pub fn capacity(&self) -> u32 {
        self.scheduler.max_parallel_jobs.max(1)
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_ms > 0).then(|| Duration::from_millis(self.reconnect_ms))
    }

    /// Agent for `taskherd dev`, pointed at the dev controller.
    pub fn dev(cluster: &str) -> Result<Self> {
        Self {
            cluster: cluster.to_string(),
            scheduler: AgentSchedulerConfig {
                max_parallel_jobs: 25,
            },
            ..Default::default()
        }
        .finalize()
    }
}
