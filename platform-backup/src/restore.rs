//! Restore coordinator.
//!
//! Stages run strictly in order and each is gated on the previous one:
//! download, extract, resolve target, repository data, database, secrets.
//! The first failure stops the run; the returned [`RestoreFailure`] names the
//! stage and lists the stages that already completed, so a partial restore
//! is visible.

use crate::archive::{self, ArchiveManager};
use crate::backup::bundle::{BundleLayout, BundleMetadata, Component};
use crate::cluster::{ClusterClient, WorkloadRef};
use crate::commands::{
    chmod_command, remove_dir_command, reset_script, restore_command, run_script_command,
    DatabaseCredentials, RESET_SCRIPT_NAME,
};
use crate::config::Config;
use crate::discovery::{self, Instance};
use crate::fs::{files_with_extension, remove_dir_if_exists};
use crate::storage::ObjectStore;
use crate::utils::errors::{BackupError, Result};
use crate::utils::with_timeout;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Local directory (under the work dir) used for downloaded archives.
pub const RESTORE_DIR: &str = "restore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStage {
    Download,
    Extract,
    ResolveTarget,
    RepoData,
    Database,
    Secrets,
}

impl RestoreStage {
    pub const ORDER: [RestoreStage; 6] = [
        RestoreStage::Download,
        RestoreStage::Extract,
        RestoreStage::ResolveTarget,
        RestoreStage::RepoData,
        RestoreStage::Database,
        RestoreStage::Secrets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RestoreStage::Download => "download",
            RestoreStage::Extract => "extract",
            RestoreStage::ResolveTarget => "resolve-target",
            RestoreStage::RepoData => "repo-data",
            RestoreStage::Database => "database",
            RestoreStage::Secrets => "secrets",
        }
    }
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Completed,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: RestoreStage,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub instance: String,
    pub archive: String,
    pub stages: Vec<StageRecord>,
}

impl RestoreReport {
    fn new(instance: &str, archive: &str) -> Self {
        Self {
            instance: instance.to_string(),
            archive: archive.to_string(),
            stages: RestoreStage::ORDER
                .iter()
                .map(|stage| StageRecord {
                    stage: *stage,
                    status: StageStatus::Pending,
                })
                .collect(),
        }
    }

    pub fn status(&self, stage: RestoreStage) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.status)
    }

    pub fn completed(&self) -> Vec<RestoreStage> {
        self.stages
            .iter()
            .filter(|r| r.status == StageStatus::Completed)
            .map(|r| r.stage)
            .collect()
    }

    fn set(&mut self, stage: RestoreStage, status: StageStatus) {
        if let Some(record) = self.stages.iter_mut().find(|r| r.stage == stage) {
            record.status = status;
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("restore of {instance} failed at stage {stage} (completed: {}): {source}", completed_list(.report))]
pub struct RestoreFailure {
    pub instance: String,
    pub stage: RestoreStage,
    pub report: RestoreReport,
    #[source]
    pub source: BackupError,
}

fn completed_list(report: &RestoreReport) -> String {
    let completed = report.completed();
    if completed.is_empty() {
        return "none".to_string();
    }
    completed
        .iter()
        .map(|s| s.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// What to restore and where.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Target namespace; also the bucket holding the archive
    pub instance: String,
    pub archive: String,
    pub allow_partial: bool,
}

impl RestoreRequest {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate_restore()?;
        match (&config.restore.instance, &config.restore.archive) {
            (Some(instance), Some(archive)) => Ok(Self {
                instance: instance.clone(),
                archive: archive.clone(),
                allow_partial: config.restore.allow_partial,
            }),
            _ => Err(BackupError::Config(
                "restore needs an instance and an archive".to_string(),
            )),
        }
    }
}

/// Extracted bundle and its metadata, if the archive carried any.
struct ExtractedBundle {
    layout: BundleLayout,
    metadata: Option<BundleMetadata>,
}

impl ExtractedBundle {
    fn component_ok(&self, component: Component) -> bool {
        self.metadata
            .as_ref()
            .map_or(true, |m| m.component_ok(component))
    }
}

struct StageRunner {
    report: RestoreReport,
}

impl StageRunner {
    async fn run<T, F>(&mut self, stage: RestoreStage, fut: F) -> std::result::Result<T, RestoreFailure>
    where
        F: Future<Output = Result<T>>,
    {
        info!(instance = %self.report.instance, stage = %stage, "Restore stage started");
        match fut.await {
            Ok(value) => {
                self.report.set(stage, StageStatus::Completed);
                info!(instance = %self.report.instance, stage = %stage, "Restore stage completed");
                Ok(value)
            }
            Err(e) => {
                error!(instance = %self.report.instance, stage = %stage, error = %e, "Restore stage failed");
                self.report.set(
                    stage,
                    StageStatus::Failed {
                        reason: e.to_string(),
                    },
                );
                Err(RestoreFailure {
                    instance: self.report.instance.clone(),
                    stage,
                    report: self.report.clone(),
                    source: e,
                })
            }
        }
    }

    fn skip(&mut self, stage: RestoreStage, reason: String) {
        warn!(instance = %self.report.instance, stage = %stage, reason = %reason, "Restore stage skipped");
        self.report.set(stage, StageStatus::Skipped { reason });
    }
}

pub struct RestoreCoordinator<'a> {
    cluster: &'a dyn ClusterClient,
    store: &'a dyn ObjectStore,
    config: &'a Config,
}

impl<'a> RestoreCoordinator<'a> {
    pub fn new(
        cluster: &'a dyn ClusterClient,
        store: &'a dyn ObjectStore,
        config: &'a Config,
    ) -> Self {
        Self {
            cluster,
            store,
            config,
        }
    }

    fn restore_dir(&self) -> PathBuf {
        self.config.backup.work_dir.join(RESTORE_DIR)
    }

    pub async fn run(
        &self,
        request: &RestoreRequest,
    ) -> std::result::Result<RestoreReport, RestoreFailure> {
        let mut runner = StageRunner {
            report: RestoreReport::new(&request.instance, &request.archive),
        };
        info!(instance = %request.instance, archive = %request.archive, "Starting restore");

        let archive_path = runner
            .run(RestoreStage::Download, self.download(request))
            .await?;

        let bundle = runner
            .run(RestoreStage::Extract, self.extract(&archive_path, request))
            .await?;

        let target = runner
            .run(
                RestoreStage::ResolveTarget,
                discovery::resolve_instance(self.cluster, self.config, &request.instance),
            )
            .await?;
        info!(
            instance = %target.name,
            repo_data = %target.config_service_ref,
            database = %target.data_store_ref,
            "Restore target resolved"
        );

        if bundle.component_ok(Component::RepoData) {
            runner
                .run(RestoreStage::RepoData, self.restore_repo_data(&target, &bundle))
                .await?;
        } else {
            runner.skip(RestoreStage::RepoData, "component missing from bundle".to_string());
        }

        if bundle.component_ok(Component::DatastoreDump) {
            runner
                .run(RestoreStage::Database, self.restore_database(&target, &bundle))
                .await?;
        } else {
            runner.skip(RestoreStage::Database, "component missing from bundle".to_string());
        }

        if bundle.component_ok(Component::Secrets) {
            runner
                .run(RestoreStage::Secrets, self.restore_secrets(&target, &bundle))
                .await?;
        } else {
            runner.skip(RestoreStage::Secrets, "component missing from bundle".to_string());
        }

        info!(instance = %request.instance, "Restore finished");
        Ok(runner.report)
    }

    async fn download(&self, request: &RestoreRequest) -> Result<PathBuf> {
        let dir = self.restore_dir();
        remove_dir_if_exists(&dir)?;
        std::fs::create_dir_all(&dir)?;

        ArchiveManager::new(self.store, self.config)
            .download(&request.instance, &request.archive, &dir)
            .await
    }

    async fn extract(&self, archive_path: &Path, request: &RestoreRequest) -> Result<ExtractedBundle> {
        let dest = self.restore_dir().join("bundle");
        let root = archive::extract(archive_path, &dest).await?;
        let root_name = root.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if root_name != request.instance {
            return Err(BackupError::ArchiveExtractFailed(format!(
                "{}: bundle root is {:?}, expected {:?}",
                archive_path.display(),
                root_name,
                request.instance
            )));
        }
        let layout = BundleLayout::at(root);

        for component in Component::ALL {
            if !layout.component_dir(component).is_dir() {
                warn!(instance = %request.instance, component = %component, "Archive has no directory for component");
            }
        }

        let metadata = BundleMetadata::read(&layout.metadata_path())?;
        match &metadata {
            None => warn!(instance = %request.instance, "Archive carries no bundle metadata, completeness unknown"),
            Some(meta) if !meta.complete => {
                let failed: Vec<String> = meta
                    .failed_components()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                if !request.allow_partial {
                    return Err(BackupError::PartialBundle(failed));
                }
                warn!(instance = %request.instance, failed = ?failed, "Restoring a partial bundle");
            }
            Some(_) => {}
        }

        Ok(ExtractedBundle { layout, metadata })
    }

    /// Push repository data, then push and run the reset script so the
    /// workload re-reads it.
    async fn restore_repo_data(&self, target: &Instance, bundle: &ExtractedBundle) -> Result<()> {
        let platform = &self.config.platform;
        let limit = self.config.remote_timeout();
        let workload = target.repo_data_target(platform);
        let source = existing_component_dir(bundle, Component::RepoData)?;

        info!(pod = %workload.pod, "Copy repository data to pod");
        with_timeout(
            &format!("copy repository data to {}", workload),
            limit,
            self.cluster
                .copy_to_workload(&workload, &source, &platform.repo_data_path),
        )
        .await?;

        let script_dir = self.restore_dir().join("scripts");
        std::fs::create_dir_all(&script_dir)?;
        std::fs::write(
            script_dir.join(RESET_SCRIPT_NAME),
            reset_script(&platform.repo_data_path),
        )?;

        info!(pod = %workload.pod, "Upload reset script to pod");
        with_timeout(
            &format!("copy reset script to {}", workload),
            limit,
            self.cluster
                .copy_to_workload(&workload, &script_dir, &platform.restore_script_dir),
        )
        .await?;

        let script_path = format!(
            "{}/{}",
            platform.restore_script_dir.trim_end_matches('/'),
            RESET_SCRIPT_NAME
        );
        info!(pod = %workload.pod, "Resetting repositories");
        self.exec_checked(&workload, chmod_command(&script_path)).await?;
        self.exec_checked(&workload, run_script_command(&script_path))
            .await?;
        Ok(())
    }

    async fn restore_database(&self, target: &Instance, bundle: &ExtractedBundle) -> Result<()> {
        let platform = &self.config.platform;
        let limit = self.config.remote_timeout();
        let workload = target.datastore_target(platform);
        let source = existing_component_dir(bundle, Component::DatastoreDump)?;

        // Leftovers would be merged with the pushed dump and restored too
        self.exec_checked(&workload, remove_dir_command(&platform.remote_dump_path))
            .await?;

        info!(pod = %workload.pod, "Upload database dump to pod");
        with_timeout(
            &format!("copy database dump to {}", workload),
            limit,
            self.cluster
                .copy_to_workload(&workload, &source, &platform.remote_dump_path),
        )
        .await?;

        let secret = with_timeout(
            &format!("read secret {}", platform.credentials_secret),
            limit,
            self.cluster
                .read_secret(&target.name, &platform.credentials_secret),
        )
        .await?;
        let creds = DatabaseCredentials::from_secret(&platform.credentials_secret, &secret)?;

        info!(pod = %workload.pod, "Restoring database");
        self.exec_checked(&workload, restore_command(platform, &creds))
            .await
    }

    /// Apply every `*.yaml` under `secrets/`. Safe to repeat.
    async fn restore_secrets(&self, target: &Instance, bundle: &ExtractedBundle) -> Result<()> {
        let source = existing_component_dir(bundle, Component::Secrets)?;
        let manifests = files_with_extension(&source, "yaml")?;
        let limit = self.config.remote_timeout();

        for file in &manifests {
            let manifest_path = file.display().to_string();
            let manifest = std::fs::read_to_string(file)?;
            with_timeout(
                &format!("apply {}", manifest_path),
                limit,
                self.cluster.apply_manifest(&target.name, &manifest),
            )
            .await
            .map_err(|e| match e {
                BackupError::Timeout { .. } => e,
                other => BackupError::ManifestApplyFailed {
                    file: manifest_path.clone(),
                    reason: other.to_string(),
                },
            })?;
            info!(instance = %target.name, manifest = %manifest_path, "Manifest applied");
        }

        info!(instance = %target.name, count = manifests.len(), "Credential secrets restored");
        Ok(())
    }

    async fn exec_checked(
        &self,
        workload: &WorkloadRef,
        command: crate::commands::RemoteCommand,
    ) -> Result<()> {
        with_timeout(
            command.display(),
            self.config.remote_timeout(),
            self.cluster.exec(workload, &command.argv),
        )
        .await?
        .check(workload, command.display())?;
        Ok(())
    }
}

fn existing_component_dir(bundle: &ExtractedBundle, component: Component) -> Result<PathBuf> {
    let dir = bundle.layout.component_dir(component);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(BackupError::ArchiveExtractFailed(format!(
            "bundle has no {} directory",
            component
        )))
    }
}
