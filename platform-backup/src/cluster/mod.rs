//! Cluster access used by discovery, backup and restore.
//!
//! Coordinators depend on the [`ClusterClient`] trait only. The default
//! implementation, [`k8s::KubeClusterClient`], talks to the API server with
//! the ambient configuration (in-cluster service account or local
//! `~/.kube/config`). Tests swap in an in-memory client.

pub mod k8s;

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// A running pod and the labels needed to classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl Workload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Address of a container inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl WorkloadRef {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.pod, self.container)
    }
}

/// Outcome of a command executed inside a workload.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit into [`BackupError::RemoteExecFailed`].
    /// `command` is the display form and must not contain secrets.
    pub fn check(self, target: &WorkloadRef, command: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(BackupError::RemoteExecFailed {
            workload: target.to_string(),
            command: command.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr_lossy(),
        })
    }
}

/// Cluster operations consumed by the coordinators.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Pods of `namespace` in the order the API server returns them.
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>>;

    /// Decoded key/value fields of a secret.
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>>;

    async fn list_secret_names(&self, namespace: &str) -> Result<Vec<String>>;

    /// Declarative YAML of a secret, stripped of server-managed metadata so
    /// it can be re-applied to a fresh cluster.
    async fn secret_manifest(&self, namespace: &str, name: &str) -> Result<String>;

    /// Copy the contents of `remote_dir` into `local_dir`.
    async fn copy_from_workload(
        &self,
        target: &WorkloadRef,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<()>;

    /// Copy the contents of `local_dir` into `remote_dir`, creating it.
    async fn copy_to_workload(
        &self,
        target: &WorkloadRef,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()>;

    /// Run `command` (argv, no shell) and capture its exit status and output.
    async fn exec(&self, target: &WorkloadRef, command: &[String]) -> Result<ExecOutput>;

    /// Server-side apply of a YAML manifest into `namespace`.
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<()>;
}
