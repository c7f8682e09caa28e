//! Configuration management for backup and restore runs.
//!
//! Loads configuration from an optional TOML file, then applies overrides from
//! `.env` and the process environment. The resulting [`Config`] is passed by
//! reference into every coordinator.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ACCESS_KEY_ID: &str = "ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "SECRET_ACCESS_KEY";
pub const ENV_ENDPOINT_URL: &str = "ENDPOINT_URL";
pub const ENV_REGION: &str = "REGION";
pub const ENV_INSTANCE: &str = "INSTANCE_NAME";
pub const ENV_ARCHIVE: &str = "BACKUP_ARCHIVE";
pub const ENV_WORK_DIR: &str = "WORK_DIR";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
/// Set by the kubelet in every pod; its presence means we run in-cluster.
pub const ENV_IN_CLUSTER: &str = "KUBERNETES_SERVICE_PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub access_key_id: Option<String>,

    pub secret_access_key: Option<String>,

    /// S3-compatible endpoint, e.g. `https://fra1.digitaloceanspaces.com`
    pub endpoint_url: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Most S3-compatible stores need path-style addressing
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

/// How a platform instance looks inside the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Pod label carrying the workload role
    #[serde(default = "default_role_label")]
    pub role_label: String,

    #[serde(default = "default_repo_data_role")]
    pub repo_data_role: String,

    #[serde(default = "default_datastore_role")]
    pub datastore_role: String,

    #[serde(default = "default_repo_data_role")]
    pub repo_data_container: String,

    #[serde(default = "default_datastore_role")]
    pub datastore_container: String,

    /// Data volume mount inside the repository-data workload
    #[serde(default = "default_repo_data_path")]
    pub repo_data_path: String,

    /// Where the dump tool writes inside the database workload
    #[serde(default = "default_remote_dump_path")]
    pub remote_dump_path: String,

    #[serde(default = "default_credentials_secret")]
    pub credentials_secret: String,

    #[serde(default = "default_secret_prefix")]
    pub secret_prefix: String,

    #[serde(default = "default_database_name")]
    pub database_name: String,

    #[serde(default = "default_database_host")]
    pub database_host: String,

    /// Remote directory receiving the reset script during restore
    #[serde(default = "default_restore_script_dir")]
    pub restore_script_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Local directory holding staging trees and archives
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Upload bundles that have a failed component (flagged in metadata)
    #[serde(default = "default_true")]
    pub upload_partial: bool,

    /// 1 keeps the batch strictly sequential
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,

    /// Skips staging cleanup; detected from the environment
    #[serde(default)]
    pub in_cluster: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Target namespace, also the source bucket
    pub instance: Option<String>,

    /// Object key of the archive to restore
    pub archive: Option<String>,

    #[serde(default)]
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for a single remote call (exec, copy, object transfer)
    #[serde(default = "default_remote_op_secs")]
    pub remote_op_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_role_label() -> String {
    "app.kubernetes.io/name".to_string()
}

fn default_repo_data_role() -> String {
    "configuration-service".to_string()
}

fn default_datastore_role() -> String {
    "mongodb".to_string()
}

fn default_repo_data_path() -> String {
    "/data".to_string()
}

fn default_remote_dump_path() -> String {
    "dump".to_string()
}

fn default_credentials_secret() -> String {
    "mongodb-credentials".to_string()
}

fn default_secret_prefix() -> String {
    "git-credentials-".to_string()
}

fn default_database_name() -> String {
    "keptn".to_string()
}

fn default_database_host() -> String {
    "localhost:27017".to_string()
}

fn default_restore_script_dir() -> String {
    "/tmp/platform-restore".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_concurrent_instances() -> usize {
    1
}

fn default_remote_op_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            endpoint_url: None,
            region: default_region(),
            force_path_style: true,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            role_label: default_role_label(),
            repo_data_role: default_repo_data_role(),
            datastore_role: default_datastore_role(),
            repo_data_container: default_repo_data_role(),
            datastore_container: default_datastore_role(),
            repo_data_path: default_repo_data_path(),
            remote_dump_path: default_remote_dump_path(),
            credentials_secret: default_credentials_secret(),
            secret_prefix: default_secret_prefix(),
            database_name: default_database_name(),
            database_host: default_database_host(),
            restore_script_dir: default_restore_script_dir(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            upload_partial: true,
            max_concurrent_instances: default_max_concurrent_instances(),
            in_cluster: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            remote_op_secs: default_remote_op_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Defaults, then the optional file, then `.env` and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = non_empty(ENV_ACCESS_KEY_ID) {
            self.storage.access_key_id = Some(v);
        }
        if let Some(v) = non_empty(ENV_SECRET_ACCESS_KEY) {
            self.storage.secret_access_key = Some(v);
        }
        if let Some(v) = non_empty(ENV_ENDPOINT_URL) {
            self.storage.endpoint_url = Some(v);
        }
        if let Some(v) = non_empty(ENV_REGION) {
            self.storage.region = v;
        }
        if let Some(v) = non_empty(ENV_INSTANCE) {
            self.restore.instance = Some(v);
        }
        if let Some(v) = non_empty(ENV_ARCHIVE) {
            self.restore.archive = Some(v);
        }
        if let Some(v) = non_empty(ENV_WORK_DIR) {
            self.backup.work_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(ENV_LOG_LEVEL) {
            self.log.level = v;
        }
        if lookup(ENV_IN_CLUSTER).is_some() {
            self.backup.in_cluster = true;
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.remote_op_secs)
    }

    /// Backup only needs object store credentials; instances are discovered.
    pub fn validate_backup(&self) -> Result<()> {
        let missing = self.missing_storage();
        report_missing(missing)
    }

    /// Restore needs the storage triple plus target instance and archive key.
    pub fn validate_restore(&self) -> Result<()> {
        let mut missing = self.missing_storage();
        if self.restore.instance.is_none() {
            missing.push(ENV_INSTANCE);
        }
        if self.restore.archive.is_none() {
            missing.push(ENV_ARCHIVE);
        }
        report_missing(missing)
    }

    fn missing_storage(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.storage.access_key_id.is_none() {
            missing.push(ENV_ACCESS_KEY_ID);
        }
        if self.storage.secret_access_key.is_none() {
            missing.push(ENV_SECRET_ACCESS_KEY);
        }
        if self.storage.endpoint_url.is_none() {
            missing.push(ENV_ENDPOINT_URL);
        }
        missing
    }
}

fn report_missing(missing: Vec<&'static str>) -> Result<()> {
    if missing.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = missing
        .iter()
        .map(|name| format!("Missing env-var {}", name))
        .collect();
    Err(BackupError::Config(messages.join("; ")))
}
