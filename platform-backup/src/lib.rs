//! Platform Backup Library
//!
//! Backup and restore of multi-tenant platform instances running in a
//! Kubernetes cluster: repository data, database dump and credential
//! secrets, packaged per instance into S3-compatible object storage.

pub mod archive;
pub mod backup;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod fs;
pub mod restore;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
