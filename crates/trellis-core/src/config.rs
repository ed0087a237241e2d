use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration, loaded from `trellis.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global loop guard: a run faults after this many cumulative steps.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Parallel run capacity of the worker pool.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Wall-clock deadline per run segment; exceeded runs are force-failed.
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    /// How often the expiry sweep cancels overdue approval gates.
    #[serde(default = "default_sweep_interval_secs")]
    pub gate_sweep_interval_secs: u64,
    /// Queue depth for the dispatcher channel.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_worker_count() -> usize {
    8
}

fn default_run_deadline_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            worker_count: default_worker_count(),
            run_deadline_secs: default_run_deadline_secs(),
            gate_sweep_interval_secs: default_sweep_interval_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// An API key the gateway accepts. The key name doubles as the acting user
/// id for approvals and workflow ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// No keys configured = anonymous access (single-user deployments).
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

fn default_bind() -> String {
    "127.0.0.1:8790".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "trellis.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TrellisError::ConfigNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| TrellisError::Config(e.to_string()))
    }

    /// Load from a file if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
