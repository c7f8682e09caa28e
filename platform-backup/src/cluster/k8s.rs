//! [`ClusterClient`] backed by the `kube` crate.
//!
//! File transfer works like `kubectl cp`: a tar stream is piped through an
//! exec session, so the target container needs `tar` and `sh`.

use super::{ClusterClient, ExecOutput, Workload, WorkloadRef};
use crate::commands::shell_quote;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{
    Api, AttachParams, AttachedProcess, DynamicObject, ListParams, Patch, PatchParams,
};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::debug;

const FIELD_MANAGER: &str = "platform-backup";
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Connect with the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn attach(
        &self,
        target: &WorkloadRef,
        command: &[String],
        stdin: bool,
    ) -> Result<AttachedProcess> {
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(stdin)
            .stdout(true)
            .stderr(true);

        Ok(self
            .pods(&target.namespace)
            .exec(&target.pod, command.to_vec(), &params)
            .await?)
    }

    async fn run(&self, target: &WorkloadRef, command: &[String]) -> Result<ExecOutput> {
        let mut attached = self.attach(target, command, false).await?;
        let (out, err) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let (stdout, stderr) = (out?, err?);

        Ok(ExecOutput {
            exit_code: finish(target, attached).await,
            stdout,
            stderr,
        })
    }

    /// Feed the tar file at `archive` into `remote_dir`.
    async fn push_tar(
        &self,
        target: &WorkloadRef,
        archive: &Path,
        len: u64,
        remote_dir: &str,
    ) -> Result<()> {
        // `head -c` bounds the read so tar sees EOF without relying on stdin close
        let script = format!(
            "mkdir -p {dir} && head -c {len} | tar xmf - -C {dir}",
            dir = shell_quote(remote_dir),
            len = len
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];

        let mut attached = self.attach(target, &command, true).await?;
        let writer = attached.stdin();
        let archive = archive.to_path_buf();
        let write_input = async move {
            if let Some(mut writer) = writer {
                let mut file = tokio::fs::File::open(&archive).await?;
                tokio::io::copy(&mut file, &mut writer).await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (written, _, err) = tokio::join!(
            write_input,
            read_all(attached.stdout()),
            read_all(attached.stderr())
        );
        let stderr = String::from_utf8_lossy(&err.unwrap_or_default()).trim().to_string();
        let exit_code = finish(target, attached).await;

        if let Err(e) = written {
            return Err(transfer_error(target, remote_dir, format!("{}: {}", e, stderr)));
        }
        if exit_code != 0 {
            return Err(transfer_error(target, remote_dir, stderr));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        let list = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| Workload {
                name: pod.name_any(),
                labels: pod.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let secret = self.secrets(namespace).get(name).await?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    async fn list_secret_names(&self, namespace: &str) -> Result<Vec<String>> {
        let list = self.secrets(namespace).list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|s| s.name_any()).collect())
    }

    async fn secret_manifest(&self, namespace: &str, name: &str) -> Result<String> {
        let mut secret = self.secrets(namespace).get(name).await?;
        strip_server_fields(&mut secret.metadata);
        Ok(serde_yaml::to_string(&secret)?)
    }

    async fn copy_from_workload(
        &self,
        target: &WorkloadRef,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<()> {
        let command = vec![
            "tar".to_string(),
            "cf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            remote_dir.to_string(),
            ".".to_string(),
        ];
        let mut attached = self.attach(target, &command, false).await?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| transfer_error(target, remote_dir, "no stdout stream".to_string()))?;

        // The tar stream is unpacked as it arrives
        let reader = SyncIoBridge::new(stdout);
        let dest = local_dir.to_path_buf();
        let unpack = tokio::task::spawn_blocking(move || unpack_tar(reader, &dest));

        let (unpacked, err) = tokio::join!(unpack, read_all(attached.stderr()));
        let stderr = String::from_utf8_lossy(&err.unwrap_or_default()).trim().to_string();
        let exit_code = finish(target, attached).await;

        if exit_code != 0 {
            return Err(transfer_error(target, remote_dir, stderr));
        }
        unpacked
            .map_err(|e| transfer_error(target, remote_dir, e.to_string()))?
            .map_err(|e| transfer_error(target, remote_dir, e.to_string()))?;

        debug!(workload = %target, remote_dir, "received tar stream");
        Ok(())
    }

    async fn copy_to_workload(
        &self,
        target: &WorkloadRef,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()> {
        // Staged on disk first; the remote side needs the length up front
        let archive = std::env::temp_dir().join(format!(
            "platform-backup-{}.tar",
            uuid::Uuid::new_v4()
        ));
        let source: PathBuf = local_dir.to_path_buf();
        let staged = archive.clone();
        let len = tokio::task::spawn_blocking(move || pack_tar(&source, &staged))
            .await
            .map_err(|e| transfer_error(target, remote_dir, e.to_string()))?
            .map_err(|e| transfer_error(target, remote_dir, e.to_string()));

        let result = match len {
            Ok(len) => self.push_tar(target, &archive, len, remote_dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = std::fs::remove_file(&archive) {
            debug!(path = %archive.display(), error = %e, "cannot remove staged tar");
        }
        result
    }

    async fn exec(&self, target: &WorkloadRef, command: &[String]) -> Result<ExecOutput> {
        self.run(target, command).await
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<()> {
        let mut object: DynamicObject = serde_yaml::from_str(manifest)?;
        let types = object
            .types
            .clone()
            .ok_or_else(|| BackupError::Config("manifest has no apiVersion/kind".to_string()))?;
        let gvk = GroupVersionKind::try_from(&types)
            .map_err(|e| BackupError::Config(format!("invalid apiVersion: {}", e)))?;
        let (resource, _caps) = kube::discovery::pinned_kind(&self.client, &gvk).await?;

        strip_server_fields(&mut object.metadata);
        object.metadata.namespace = Some(namespace.to_string());
        let name = object.name_any();

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await?;
        Ok(())
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn transfer_error(target: &WorkloadRef, path: &str, reason: String) -> BackupError {
    BackupError::FileTransferFailed {
        workload: target.to_string(),
        path: path.to_string(),
        reason,
    }
}

/// Exit code of a finished session. Must be called after the output
/// streams are drained.
async fn finish(target: &WorkloadRef, mut attached: AttachedProcess) -> i32 {
    let status = match attached.take_status() {
        Some(status) => status.await,
        None => None,
    };
    if let Err(e) = attached.join().await {
        debug!(workload = %target, error = %e, "exec session closed with error");
    }
    exit_code_from_status(status.as_ref())
}

fn unpack_tar<R: Read>(reader: R, local_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(local_dir)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(local_dir)?;
    // Drain the trailing record padding so the remote tar can exit
    std::io::copy(&mut archive.into_inner(), &mut std::io::sink())?;
    Ok(())
}

fn pack_tar(local_dir: &Path, target: &Path) -> std::io::Result<u64> {
    let mut builder = tar::Builder::new(File::create(target)?);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", local_dir)?;
    let file = builder.into_inner()?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Map the exec status channel to a process exit code. A missing status
/// means the session ended without reporting, which counts as failure.
fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse().ok())
        })
        .unwrap_or(1)
}

/// Drop fields the API server owns so the manifest applies cleanly elsewhere.
fn strip_server_fields(meta: &mut ObjectMeta) {
    meta.managed_fields = None;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.owner_references = None;
    meta.namespace = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
}
