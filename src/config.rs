use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transfer::{PartPlanConfig, WorkerConfig};
use crate::transfer::events::DEFAULT_EVENT_CAPACITY;
use crate::transfer::lease::DEFAULT_LEASE_TTL;
use crate::transfer::planner::{MAXIMUM_UPLOAD_PARTS, MINIMUM_UPLOAD_PART_SIZE};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Mirror log lines to stderr
    #[serde(default = "default_log_console")]
    pub log_console: bool,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_log_console() -> bool {
    true
}

/// Transfer table location
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/transfers.db".to_string(),
            max_connections: 4,
        }
    }
}

/// Part planning and worker tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub min_part_size: u64,
    pub max_parts: u32,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub progress_interval_bytes: u64,
    /// 0 disables the periodic WAITING scan
    pub scan_interval_ms: u64,
    /// 0 disables polling for commands queued by other processes
    pub command_poll_ms: u64,
    /// Worker lease expiry; renewed every third of it
    pub lease_ttl_ms: u64,
    pub event_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_part_size: MINIMUM_UPLOAD_PART_SIZE,
            max_parts: MAXIMUM_UPLOAD_PARTS,
            chunk_size: 64 * 1024,
            concurrency: 4,
            progress_interval_bytes: 1024 * 1024,
            scan_interval_ms: 30_000,
            command_poll_ms: 1_000,
            lease_ttl_ms: DEFAULT_LEASE_TTL.as_millis() as u64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TransferConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency.max(1),
            chunk_size: self.chunk_size.max(1),
            progress_interval_bytes: self.progress_interval_bytes.max(1),
            scan_interval: (self.scan_interval_ms > 0)
                .then(|| Duration::from_millis(self.scan_interval_ms)),
            command_poll_interval: (self.command_poll_ms > 0)
                .then(|| Duration::from_millis(self.command_poll_ms)),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.max(1))
    }

    pub fn part_plan_config(&self) -> PartPlanConfig {
        PartPlanConfig {
            min_part_size: self.min_part_size,
            max_parts: self.max_parts,
        }
    }
}

/// Object store backend
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Root directory of the LocalObjectStore
    pub root_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root_dir: "./data/objects".to_string(),
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self> {
        Self::load_from(format!("config/{}.yaml", env))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config yaml")
    }

    pub fn remote_root(&self) -> PathBuf {
        PathBuf::from(&self.remote.root_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: transfer.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_sections_default() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.rotation, "daily");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.transfer.min_part_size, MINIMUM_UPLOAD_PART_SIZE);
        assert_eq!(config.remote_root(), PathBuf::from("./data/objects"));

        assert!(config.log_console);
        assert_eq!(config.transfer.lease_ttl(), DEFAULT_LEASE_TTL);

        let worker = config.transfer.worker_config();
        assert_eq!(worker.scan_interval, Some(Duration::from_secs(30)));
        assert_eq!(worker.command_poll_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_transfer_overrides() {
        let yaml = format!(
            "{}log_console: false\ntransfer:\n  min_part_size: 1024\n  scan_interval_ms: 0\n  command_poll_ms: 0\n  lease_ttl_ms: 3000\n  concurrency: 0\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();

        assert_eq!(config.transfer.part_plan_config().min_part_size, 1024);
        assert_eq!(config.transfer.max_parts, MAXIMUM_UPLOAD_PARTS);
        let worker = config.transfer.worker_config();
        assert!(worker.scan_interval.is_none());
        assert!(worker.command_poll_interval.is_none());
        assert_eq!(worker.concurrency, 1);
        assert!(!config.log_console);
        assert_eq!(config.transfer.lease_ttl(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = AppConfig::load_from("does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.yaml"));
    }

    #[test]
    fn test_dev_config_parses() {
        let config = AppConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.yaml"))
            .unwrap();
        assert!(config.database.url.starts_with("sqlite:"));
    }
}
