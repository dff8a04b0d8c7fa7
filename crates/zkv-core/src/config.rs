use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{VaultError, VaultResult};

/// Top-level configuration (loaded from zkv.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkvConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub naming: NamingConfig,
    pub custody: CustodyConfig,
    pub devices: DevicesConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Directory of custodial enrollment JSON files
    pub enrollments_dir: PathBuf,
    /// Custodian epoch table (public epoch metadata)
    pub epoch_file: PathBuf,
    /// Custodian epoch private keys (must only live on the custodian host)
    pub custodian_key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend: "memory" or "fs"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Key prefix for naming records and content blobs
    pub prefix: String,
    /// Archived file versions kept per file; older ones are unpinned
    pub keep_versions: usize,
}

/// Naming-layer publish/resolve tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Validity of a published record before it must be re-asserted (default: 1 day)
    pub record_ttl_secs: u64,
    /// Attempts before a transient failure surfaces as PublishUnavailable
    pub max_publish_attempts: u32,
    /// First backoff delay in milliseconds (doubles per attempt)
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds
    pub backoff_max_ms: u64,
    /// Path of the persisted last-observed sequence cache
    pub sequence_cache: Option<PathBuf>,
}

/// Custodial delegation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Planned lifetime of a custodian epoch (default: 30 days)
    pub epoch_lifetime_secs: u64,
    /// How long a superseded epoch's envelopes are still honored (default: 7 days)
    pub grace_period_secs: u64,
    /// Interval between republish cycles per entity (default: 4 hours)
    pub republish_interval_secs: u64,
    /// Upper bound on one entity's decrypt/re-sign/publish cycle
    pub cycle_timeout_secs: u64,
    /// Report a rotation as due this long before the active epoch's planned end
    pub rotation_lead_secs: u64,
}

/// Device authorization tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Lifetime of an authorization request on the bulletin board
    pub request_ttl_secs: u64,
    /// Maximum simultaneously pending authorization requests
    pub max_pending_requests: usize,
    /// Requester poll interval in milliseconds
    pub poll_interval_ms: u64,
}

/// Argon2id parameters for stretching a recovery phrase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub argon2_mem_cost_kib: u32,
    pub argon2_time_cost: u32,
    pub argon2_parallelism: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
            enrollments_dir: PathBuf::from("/var/lib/zkvd/enrollments"),
            epoch_file: PathBuf::from("/var/lib/zkvd/epochs.json"),
            custodian_key_file: PathBuf::from("/var/lib/zkvd/custodian-keys.json"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            root: PathBuf::from("/var/lib/zkvd/store"),
            prefix: "zkv".into(),
            keep_versions: 10,
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 24 * 3600,
            max_publish_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            sequence_cache: None,
        }
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            epoch_lifetime_secs: 30 * 24 * 3600,
            grace_period_secs: 7 * 24 * 3600,
            republish_interval_secs: 4 * 3600,
            cycle_timeout_secs: 30,
            rotation_lead_secs: 3 * 24 * 3600,
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 600,
            max_pending_requests: 5,
            poll_interval_ms: 2_000,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 16384,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
        }
    }
}

impl NamingConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl CustodyConfig {
    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

impl ZkvConfig {
    /// Parse a zkv.toml document; missing sections take their defaults.
    pub fn from_toml(content: &str) -> VaultResult<Self> {
        toml::from_str(content).map_err(|e| VaultError::Config(e.to_string()))
    }
}

impl DevicesConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
