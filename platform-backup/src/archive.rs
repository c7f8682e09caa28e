//! Packaging of staging trees into timestamped `.tar.gz` archives and their
//! transfer to and from the object store.
//!
//! Archives are named `{instance}_{YYYY-MM-DD-HH_MM_SS}.tar.gz` and stored in
//! the bucket named after the instance, under a key equal to the file name.
//! The timestamp is taken at packaging time, not capture time.

use crate::backup::bundle::BundleLayout;
use crate::config::Config;
use crate::storage::ObjectStore;
use crate::utils::errors::{BackupError, Result};
use crate::utils::{format_bytes, with_timeout};
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ARCHIVE_EXTENSION: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H_%M_%S";

/// An archive written to local disk, ready for upload.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub instance: String,
    pub bucket: String,
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub fn archive_name(instance: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}{}", instance, at.format(TIMESTAMP_FORMAT), ARCHIVE_EXTENSION)
}

/// Split an archive key into instance name and timestamp.
pub fn parse_archive_name(key: &str) -> Option<(String, NaiveDateTime)> {
    let stem = key.strip_suffix(ARCHIVE_EXTENSION)?;
    let (instance, stamp) = stem.rsplit_once('_').and_then(|(head, minutes_seconds)| {
        // The timestamp itself contains two underscores
        let (head, hour_minutes) = head.rsplit_once('_')?;
        let (instance, date_hour) = head.rsplit_once('_')?;
        Some((
            instance,
            format!("{}_{}_{}", date_hour, hour_minutes, minutes_seconds),
        ))
    })?;
    let at = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).ok()?;
    if instance.is_empty() {
        return None;
    }
    Some((instance.to_string(), at))
}

pub struct ArchiveManager<'a> {
    store: &'a dyn ObjectStore,
    config: &'a Config,
}

impl<'a> ArchiveManager<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a Config) -> Self {
        Self { store, config }
    }

    /// Pack `layout` into `{work_dir}/{archive_name}` with the instance name
    /// as the archive root.
    pub async fn create(&self, layout: &BundleLayout, instance: &str) -> Result<ArchiveRecord> {
        let created_at = Utc::now();
        let key = archive_name(instance, created_at);
        let path = self.config.backup.work_dir.join(&key);

        info!(instance, archive = %key, "Creating archive");

        let source = layout.root().to_path_buf();
        let target = path.clone();
        let root_name = instance.to_string();
        let size_bytes = tokio::task::spawn_blocking(move || pack(&source, &root_name, &target))
            .await
            .map_err(|e| BackupError::ArchiveCreateFailed(e.to_string()))?
            .map_err(|e| BackupError::ArchiveCreateFailed(format!("{}: {}", path.display(), e)))?;

        info!(instance, archive = %key, size = %format_bytes(size_bytes), "Archive created");

        Ok(ArchiveRecord {
            instance: instance.to_string(),
            bucket: instance.to_string(),
            key,
            path,
            size_bytes,
            created_at,
        })
    }

    pub async fn upload(&self, record: &ArchiveRecord) -> Result<()> {
        info!(instance = %record.instance, "Upload archive {} to bucket {}...", record.key, record.bucket);
        with_timeout(
            &format!("upload of {}", record.key),
            self.config.remote_timeout(),
            self.store.put_file(&record.bucket, &record.key, &record.path),
        )
        .await
    }

    /// Fetch `bucket/key` into `dest_dir/key`.
    pub async fn download(&self, bucket: &str, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        if key.contains('/') || key.contains("..") {
            return Err(BackupError::Config(format!(
                "archive key {} must be a plain file name",
                key
            )));
        }
        let path = dest_dir.join(key);
        info!(bucket, key, "Download backup...");
        with_timeout(
            &format!("download of {}", key),
            self.config.remote_timeout(),
            self.store.get_file(bucket, key, &path),
        )
        .await?;
        Ok(path)
    }
}

/// Unpack `archive` into `dest_dir` and return the bundle root, the single
/// top-level directory of the archive.
pub async fn extract(archive: &Path, dest_dir: &Path) -> Result<PathBuf> {
    info!(archive = %archive.display(), "Extract archive...");
    let archive = archive.to_path_buf();
    let dest = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .map_err(|e| BackupError::ArchiveExtractFailed(e.to_string()))?
}

fn pack(source: &Path, root_name: &str, target: &Path) -> std::io::Result<u64> {
    let file = File::create(target)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(root_name, source)?;

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn unpack(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let extract_err = |e: std::io::Error| {
        BackupError::ArchiveExtractFailed(format!("{}: {}", archive.display(), e))
    };

    std::fs::create_dir_all(dest)?;
    let file = File::open(archive).map_err(extract_err)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(extract_err)?;

    let mut roots = Vec::new();
    for entry in std::fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            roots.push(entry.path());
        }
    }

    match roots.len() {
        1 => Ok(roots.remove(0)),
        n => Err(BackupError::ArchiveExtractFailed(format!(
            "{}: expected one root directory, found {}",
            archive.display(),
            n
        ))),
    }
}
