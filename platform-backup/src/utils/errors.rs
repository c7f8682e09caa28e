//! Error taxonomy for backup and restore runs.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Discovery incomplete in namespace {namespace}: no workload with role {missing}")]
    DiscoveryIncomplete { namespace: String, missing: String },

    #[error("Discovery ambiguous in namespace {namespace}: {count} candidates for {role}")]
    DiscoveryAmbiguous {
        namespace: String,
        role: String,
        count: usize,
    },

    #[error("Remote command `{command}` in {workload} exited with {exit_code}: {stderr}")]
    RemoteExecFailed {
        workload: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("File transfer failed for {workload}:{path}: {reason}")]
    FileTransferFailed {
        workload: String,
        path: String,
        reason: String,
    },

    #[error("Archive creation failed: {0}")]
    ArchiveCreateFailed(String),

    #[error("Archive extraction failed: {0}")]
    ArchiveExtractFailed(String),

    #[error("Object store error on {bucket}/{key}: {reason}")]
    ObjectStoreFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Applying manifest {file} failed: {reason}")]
    ManifestApplyFailed { file: String, reason: String },

    #[error("Bundle is incomplete, failed components: {}", .0.join(", "))]
    PartialBundle(Vec<String>),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
