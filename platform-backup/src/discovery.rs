//! Instance discovery.
//!
//! A namespace holds a platform instance when it runs both a repository-data
//! workload and a database workload, identified by the role label. Pods
//! without the label are skipped. When several pods share a role the last
//! one listed wins; this is logged, not rejected.

use crate::cluster::{ClusterClient, Workload, WorkloadRef};
use crate::config::{Config, PlatformConfig};
use crate::utils::errors::{BackupError, Result};
use crate::utils::with_timeout;
use serde::Serialize;
use tracing::{info, warn};

/// One platform deployment. Both refs are always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub name: String,
    pub config_service_ref: String,
    pub data_store_ref: String,
}

impl Instance {
    pub fn repo_data_target(&self, platform: &PlatformConfig) -> WorkloadRef {
        WorkloadRef::new(
            &self.name,
            &self.config_service_ref,
            &platform.repo_data_container,
        )
    }

    pub fn datastore_target(&self, platform: &PlatformConfig) -> WorkloadRef {
        WorkloadRef::new(
            &self.name,
            &self.data_store_ref,
            &platform.datastore_container,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    RepoData,
    DataStore,
}

/// Classification of a single workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    Known(Role),
    /// No role label, or a value that is neither role
    Undetermined,
}

pub fn classify(workload: &Workload, platform: &PlatformConfig) -> RoleOutcome {
    match workload.label(&platform.role_label) {
        Some(value) if value == platform.repo_data_role => RoleOutcome::Known(Role::RepoData),
        Some(value) if value == platform.datastore_role => RoleOutcome::Known(Role::DataStore),
        _ => RoleOutcome::Undetermined,
    }
}

/// What one namespace scan found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScan {
    Found(Instance),
    /// Exactly one of the two roles was seen
    Incomplete { missing: Role },
    Empty,
}

/// Classify the workloads of `namespace`, last write wins per role.
pub fn scan_namespace(
    namespace: &str,
    workloads: &[Workload],
    platform: &PlatformConfig,
) -> NamespaceScan {
    let mut repo_data: Option<&str> = None;
    let mut data_store: Option<&str> = None;
    let mut repo_data_seen = 0usize;
    let mut data_store_seen = 0usize;

    for workload in workloads {
        match classify(workload, platform) {
            RoleOutcome::Known(Role::RepoData) => {
                info!(namespace, pod = %workload.name, "Found repository-data workload");
                repo_data = Some(workload.name.as_str());
                repo_data_seen += 1;
            }
            RoleOutcome::Known(Role::DataStore) => {
                info!(namespace, pod = %workload.name, "Found database workload");
                data_store = Some(workload.name.as_str());
                data_store_seen += 1;
            }
            RoleOutcome::Undetermined => {}
        }
    }

    for (role, count) in [
        (&platform.repo_data_role, repo_data_seen),
        (&platform.datastore_role, data_store_seen),
    ] {
        if count > 1 {
            let ambiguity = BackupError::DiscoveryAmbiguous {
                namespace: namespace.to_string(),
                role: role.clone(),
                count,
            };
            warn!("{}; using the last one listed", ambiguity);
        }
    }

    match (repo_data, data_store) {
        (Some(repo), Some(store)) => NamespaceScan::Found(Instance {
            name: namespace.to_string(),
            config_service_ref: repo.to_string(),
            data_store_ref: store.to_string(),
        }),
        (Some(_), None) => NamespaceScan::Incomplete {
            missing: Role::DataStore,
        },
        (None, Some(_)) => NamespaceScan::Incomplete {
            missing: Role::RepoData,
        },
        (None, None) => NamespaceScan::Empty,
    }
}

/// Which namespaces a discovery run looks at.
#[derive(Debug, Clone)]
pub enum Scope {
    AllNamespaces,
    Namespace(String),
}

/// Find every complete instance in `scope`.
pub async fn discover(
    cluster: &dyn ClusterClient,
    config: &Config,
    scope: &Scope,
) -> Result<Vec<Instance>> {
    info!("Searching for platform instances...");
    let limit = config.remote_timeout();

    let namespaces = match scope {
        Scope::AllNamespaces => {
            with_timeout("list namespaces", limit, cluster.list_namespaces()).await?
        }
        Scope::Namespace(name) => vec![name.clone()],
    };

    let mut instances = Vec::new();
    for namespace in &namespaces {
        let workloads = match with_timeout(
            &format!("list pods in {}", namespace),
            limit,
            cluster.list_workloads(namespace),
        )
        .await
        {
            Ok(workloads) => workloads,
            Err(e) if matches!(scope, Scope::AllNamespaces) => {
                warn!(namespace = %namespace, error = %e, "Skipping namespace, cannot list pods");
                continue;
            }
            Err(e) => return Err(e),
        };

        match scan_namespace(namespace, &workloads, &config.platform) {
            NamespaceScan::Found(instance) => instances.push(instance),
            NamespaceScan::Incomplete { missing } => {
                warn!("{}", incomplete_error(namespace, missing, &config.platform));
            }
            NamespaceScan::Empty => {}
        }
    }

    info!(count = instances.len(), "Instance discovery finished");
    Ok(instances)
}

/// Restore mode: exactly one instance must live in `namespace`.
pub async fn resolve_instance(
    cluster: &dyn ClusterClient,
    config: &Config,
    namespace: &str,
) -> Result<Instance> {
    let limit = config.remote_timeout();
    let workloads = with_timeout(
        &format!("list pods in {}", namespace),
        limit,
        cluster.list_workloads(namespace),
    )
    .await?;

    match scan_namespace(namespace, &workloads, &config.platform) {
        NamespaceScan::Found(instance) => Ok(instance),
        NamespaceScan::Incomplete { missing } => {
            Err(incomplete_error(namespace, missing, &config.platform))
        }
        NamespaceScan::Empty => Err(BackupError::DiscoveryIncomplete {
            namespace: namespace.to_string(),
            missing: format!(
                "{} and {}",
                config.platform.repo_data_role, config.platform.datastore_role
            ),
        }),
    }
}

fn incomplete_error(namespace: &str, missing: Role, platform: &PlatformConfig) -> BackupError {
    let missing = match missing {
        Role::RepoData => platform.repo_data_role.clone(),
        Role::DataStore => platform.datastore_role.clone(),
    };
    BackupError::DiscoveryIncomplete {
        namespace: namespace.to_string(),
        missing,
    }
}
