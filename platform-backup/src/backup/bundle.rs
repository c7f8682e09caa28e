//! Bundle layout and metadata.
//!
//! A bundle is staged as `{work_dir}/{instance}/` with one directory per
//! component plus `.bundle-meta.json`, which records per-component outcomes
//! and whether the bundle is complete.

use crate::fs::{remove_dir_if_exists, TreeStats};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = ".bundle-meta.json";
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    RepoData,
    DatastoreDump,
    Secrets,
}

impl Component {
    /// Capture order.
    pub const ALL: [Component; 3] = [
        Component::RepoData,
        Component::DatastoreDump,
        Component::Secrets,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Component::RepoData => "repo-data",
            Component::DatastoreDump => "datastore-dump",
            Component::Secrets => "secrets",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureStatus {
    Success,
    PartialFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentOutcome {
    pub component: Component,
    #[serde(flatten)]
    pub status: CaptureStatus,
    #[serde(default)]
    pub stats: TreeStats,
}

impl ComponentOutcome {
    pub fn is_success(&self) -> bool {
        self.status == CaptureStatus::Success
    }
}

/// Paths of one instance's staging tree.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(work_dir: &Path, instance: &str) -> Self {
        Self {
            root: work_dir.join(instance),
        }
    }

    /// Wrap an already extracted bundle root.
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn component_dir(&self, component: Component) -> PathBuf {
        self.root.join(component.dir_name())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Create the component directories. With `clean` any previous staging
    /// tree is removed first.
    pub fn prepare(&self, clean: bool) -> std::io::Result<()> {
        if clean {
            remove_dir_if_exists(&self.root)?;
        }
        for component in Component::ALL {
            std::fs::create_dir_all(self.component_dir(component))?;
        }
        Ok(())
    }
}

/// Contents of `.bundle-meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub version: u32,
    pub run_id: String,
    pub instance: String,
    pub host: String,
    pub captured_at: DateTime<Utc>,
    pub components: Vec<ComponentOutcome>,
    pub complete: bool,
}

impl BundleMetadata {
    pub fn new(
        run_id: &str,
        instance: &str,
        captured_at: DateTime<Utc>,
        components: Vec<ComponentOutcome>,
    ) -> Self {
        let complete = Component::ALL.iter().all(|c| {
            components
                .iter()
                .any(|o| o.component == *c && o.is_success())
        });

        Self {
            version: METADATA_VERSION,
            run_id: run_id.to_string(),
            instance: instance.to_string(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            captured_at,
            components,
            complete,
        }
    }

    pub fn failed_components(&self) -> Vec<Component> {
        self.components
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.component)
            .collect()
    }

    pub fn component_ok(&self, component: Component) -> bool {
        !self.failed_components().contains(&component)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read metadata if the bundle carries any.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
