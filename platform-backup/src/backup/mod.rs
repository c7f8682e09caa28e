//! Backup coordinator - captures one instance into a staging tree, and the
//! batch that runs it for every discovered instance.
//!
//! Each instance goes through:
//! - repository data capture
//! - database dump capture
//! - credential secret capture
//! - packaging and upload
//!
//! A failed component is recorded in the bundle metadata and does not stop
//! the remaining components. Packaging or upload failure is fatal for that
//! instance only; the batch moves on.

pub mod bundle;

use crate::archive::{ArchiveManager, ArchiveRecord};
use crate::cluster::{ClusterClient, WorkloadRef};
use crate::commands::{dump_command, remove_dir_command, DatabaseCredentials, RemoteCommand};
use crate::config::Config;
use crate::discovery::{self, Instance, Scope};
use crate::fs::{tree_stats, TreeStats};
use crate::storage::ObjectStore;
use crate::utils::errors::{BackupError, Result};
use crate::utils::with_timeout;
use bundle::{BundleLayout, BundleMetadata, CaptureStatus, Component, ComponentOutcome};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const REPORT_FILE: &str = "backup-report.json";

/// A staged bundle ready for packaging.
#[derive(Debug)]
pub struct CapturedBundle {
    pub layout: BundleLayout,
    pub metadata: BundleMetadata,
}

pub struct BackupCoordinator<'a> {
    cluster: &'a dyn ClusterClient,
    config: &'a Config,
}

impl<'a> BackupCoordinator<'a> {
    pub fn new(cluster: &'a dyn ClusterClient, config: &'a Config) -> Self {
        Self { cluster, config }
    }

    /// Capture the three components of `instance` in fixed order. Only local
    /// staging errors are returned; component failures end up in the
    /// metadata.
    pub async fn capture(&self, instance: &Instance, run_id: &str) -> Result<CapturedBundle> {
        let captured_at = Utc::now();
        let layout = BundleLayout::new(&self.config.backup.work_dir, &instance.name);

        // Inside the cluster the working directory is container scoped
        let clean = !self.config.backup.in_cluster;
        layout.prepare(clean)?;

        let mut components = Vec::with_capacity(Component::ALL.len());
        for component in Component::ALL {
            let dir = layout.component_dir(component);
            let result = match component {
                Component::RepoData => self.capture_repo_data(instance, &dir).await,
                Component::DatastoreDump => self.capture_datastore(instance, &dir).await,
                Component::Secrets => self.capture_secrets(instance, &dir).await,
            };

            let status = match result {
                Ok(()) => CaptureStatus::Success,
                Err(e) => {
                    error!(instance = %instance.name, component = %component, error = %e, "Component capture failed");
                    CaptureStatus::PartialFailure {
                        reason: e.to_string(),
                    }
                }
            };
            let stats = tree_stats(&dir).unwrap_or_else(|e| {
                warn!(instance = %instance.name, component = %component, error = %e, "Cannot measure staged component");
                TreeStats::default()
            });

            components.push(ComponentOutcome {
                component,
                status,
                stats,
            });
        }

        let metadata = BundleMetadata::new(run_id, &instance.name, captured_at, components);
        metadata.write(&layout.metadata_path())?;

        if !metadata.complete {
            warn!(
                instance = %instance.name,
                failed = ?metadata.failed_components(),
                "Bundle is partial"
            );
        }

        Ok(CapturedBundle { layout, metadata })
    }

    /// Pull the repository data volume. Writers are not quiesced, so the
    /// copy may be torn if the workload writes meanwhile.
    async fn capture_repo_data(&self, instance: &Instance, dir: &Path) -> Result<()> {
        let platform = &self.config.platform;
        let target = instance.repo_data_target(platform);
        info!(instance = %instance.name, pod = %target.pod, "Backup repository data");

        with_timeout(
            &format!("copy {} from {}", platform.repo_data_path, target),
            self.config.remote_timeout(),
            self.cluster
                .copy_from_workload(&target, &platform.repo_data_path, dir),
        )
        .await
    }

    async fn capture_datastore(&self, instance: &Instance, dir: &Path) -> Result<()> {
        let platform = &self.config.platform;
        let limit = self.config.remote_timeout();
        let target = instance.datastore_target(platform);
        info!(instance = %instance.name, pod = %target.pod, "Backup database");

        let secret = with_timeout(
            &format!("read secret {}", platform.credentials_secret),
            limit,
            self.cluster
                .read_secret(&instance.name, &platform.credentials_secret),
        )
        .await?;
        let creds = DatabaseCredentials::from_secret(&platform.credentials_secret, &secret)?;

        // mongodump writes into the existing directory, so a previous dump
        // would leak dropped collections into this bundle
        self.exec_checked(&target, remove_dir_command(&platform.remote_dump_path))
            .await?;
        self.exec_checked(&target, dump_command(platform, &creds))
            .await?;

        with_timeout(
            &format!("copy {} from {}", platform.remote_dump_path, target),
            limit,
            self.cluster
                .copy_from_workload(&target, &platform.remote_dump_path, dir),
        )
        .await?;

        if let Err(e) = self
            .exec_checked(&target, remove_dir_command(&platform.remote_dump_path))
            .await
        {
            warn!(instance = %instance.name, pod = %target.pod, error = %e, "Cannot remove remote dump");
        }
        Ok(())
    }

    async fn exec_checked(&self, target: &WorkloadRef, command: RemoteCommand) -> Result<()> {
        with_timeout(
            command.display(),
            self.config.remote_timeout(),
            self.cluster.exec(target, &command.argv),
        )
        .await?
        .check(target, command.display())?;
        Ok(())
    }

    /// Serialize every secret matching the prefix into `{name}.yaml`. One
    /// failing secret does not stop the others.
    async fn capture_secrets(&self, instance: &Instance, dir: &Path) -> Result<()> {
        let platform = &self.config.platform;
        let limit = self.config.remote_timeout();
        info!(instance = %instance.name, "Dumping credential secrets");

        let names = with_timeout(
            "list secrets",
            limit,
            self.cluster.list_secret_names(&instance.name),
        )
        .await?;

        let mut failed = Vec::new();
        let mut written = 0usize;
        for name in names
            .iter()
            .filter(|n| n.starts_with(&platform.secret_prefix))
        {
            let manifest = with_timeout(
                &format!("get secret {}", name),
                limit,
                self.cluster.secret_manifest(&instance.name, name),
            )
            .await;

            match manifest {
                Ok(yaml) => {
                    std::fs::write(dir.join(format!("{}.yaml", name)), yaml)?;
                    written += 1;
                }
                Err(e) => {
                    warn!(instance = %instance.name, secret = %name, error = %e, "Cannot export secret");
                    failed.push(format!("{}: {}", name, e));
                }
            }
        }

        info!(instance = %instance.name, count = written, "Credential secrets exported");

        if failed.is_empty() {
            Ok(())
        } else {
            Err(BackupError::FileTransferFailed {
                workload: instance.name.clone(),
                path: "secrets".to_string(),
                reason: failed.join("; "),
            })
        }
    }
}

/// Outcome of one instance in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance: String,
    pub components: Vec<ComponentOutcome>,
    pub complete: bool,
    pub archive: Option<ArchiveRecord>,
    pub uploaded: bool,
    pub error: Option<String>,
}

impl InstanceReport {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            components: Vec::new(),
            complete: false,
            archive: None,
            uploaded: false,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.uploaded && self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub instances: Vec<InstanceReport>,
    /// Instances not started because of a shutdown request
    pub skipped: Vec<String>,
}

impl BackupReport {
    pub fn failed(&self) -> Vec<&InstanceReport> {
        self.instances.iter().filter(|r| !r.succeeded()).collect()
    }

    pub fn write(&self, work_dir: &Path) -> Result<PathBuf> {
        let path = work_dir.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

enum BatchItem {
    Done(InstanceReport),
    Skipped(String),
}

/// Back up every discovered instance. Up to `max_concurrent_instances` run
/// at once; results keep discovery order.
pub async fn run_backup(
    cluster: &dyn ClusterClient,
    store: &dyn ObjectStore,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<BackupReport> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    info!(run_id = %run_id, "Starting backup run");

    std::fs::create_dir_all(&config.backup.work_dir)?;
    let instances = discovery::discover(cluster, config, &Scope::AllNamespaces).await?;

    let parallelism = config.backup.max_concurrent_instances.max(1);
    let items: Vec<BatchItem> = stream::iter(instances.iter())
        .map(|instance| {
            let run_id = run_id.as_str();
            async move {
                if cancel.is_cancelled() {
                    info!(instance = %instance.name, "Shutdown requested, not starting");
                    return BatchItem::Skipped(instance.name.clone());
                }
                BatchItem::Done(backup_instance(cluster, store, config, instance, run_id).await)
            }
        })
        .buffered(parallelism)
        .collect()
        .await;

    let mut report = BackupReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        instances: Vec::new(),
        skipped: Vec::new(),
    };
    for item in items {
        match item {
            BatchItem::Done(r) => report.instances.push(r),
            BatchItem::Skipped(name) => report.skipped.push(name),
        }
    }

    match report.write(&config.backup.work_dir) {
        Ok(path) => info!(report = %path.display(), "Backup report written"),
        Err(e) => warn!(error = %e, "Failed to write backup report"),
    }

    info!(
        instances = report.instances.len(),
        failed = report.failed().len(),
        skipped = report.skipped.len(),
        "Backup run finished"
    );
    Ok(report)
}

/// Capture, package and upload one instance. Never returns an error; the
/// report carries it.
pub async fn backup_instance(
    cluster: &dyn ClusterClient,
    store: &dyn ObjectStore,
    config: &Config,
    instance: &Instance,
    run_id: &str,
) -> InstanceReport {
    let mut report = InstanceReport::new(&instance.name);

    let captured = match BackupCoordinator::new(cluster, config)
        .capture(instance, run_id)
        .await
    {
        Ok(captured) => captured,
        Err(e) => {
            error!(instance = %instance.name, error = %e, "Staging failed");
            report.error = Some(format!("staging: {}", e));
            return report;
        }
    };
    report.components = captured.metadata.components.clone();
    report.complete = captured.metadata.complete;

    let archives = ArchiveManager::new(store, config);
    let record = match archives.create(&captured.layout, &instance.name).await {
        Ok(record) => record,
        Err(e) => {
            error!(instance = %instance.name, error = %e, "Archive creation failed");
            report.error = Some(format!("archive: {}", e));
            return report;
        }
    };
    report.archive = Some(record.clone());

    if !captured.metadata.complete && !config.backup.upload_partial {
        let failed = captured
            .metadata
            .failed_components()
            .iter()
            .map(ToString::to_string)
            .collect();
        let e = BackupError::PartialBundle(failed);
        warn!(instance = %instance.name, archive = %record.key, "{}; not uploading", e);
        report.error = Some(format!("upload: {}", e));
        return report;
    }

    match archives.upload(&record).await {
        Ok(()) => report.uploaded = true,
        Err(e) => {
            error!(instance = %instance.name, error = %e, "Upload failed");
            report.error = Some(format!("upload: {}", e));
        }
    }

    report
}
