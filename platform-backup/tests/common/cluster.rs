use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use platform_backup::cluster::{ClusterClient, ExecOutput, Workload, WorkloadRef};
use platform_backup::{BackupError, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Where the fake database keeps its contents inside the database pod.
pub const DB_STATE_DIR: &str = "var/lib/db";

/// Secret manifest as written by the mock. Values are kept as plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: SecretMetadata,
    #[serde(rename = "stringData", default)]
    pub string_data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub name: String,
}

#[derive(Default)]
struct State {
    namespaces: Vec<String>,
    workloads: HashMap<String, Vec<Workload>>,
    secrets: HashMap<String, BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    exec_failures: HashMap<String, (i32, String)>,
    unlistable: HashSet<String>,
    apply_failures: HashSet<String>,
    fail_copy_to: bool,
    calls: Vec<String>,
    applies: usize,
}

/// In-memory cluster. Each pod gets its own temporary directory acting as
/// the container filesystem; relative remote paths resolve against it too.
pub struct MockClusterClient {
    state: Mutex<State>,
    pods: Mutex<HashMap<(String, String), TempDir>>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pods: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_namespace(&self, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.namespaces.iter().any(|n| n == namespace) {
            state.namespaces.push(namespace.to_string());
        }
    }

    pub fn add_pod(&self, namespace: &str, pod: &str, labels: &[(&str, &str)]) {
        self.add_namespace(namespace);
        let mut workload = Workload::new(pod);
        for (key, value) in labels {
            workload = workload.with_label(*key, *value);
        }
        self.state
            .lock()
            .unwrap()
            .workloads
            .entry(namespace.to_string())
            .or_default()
            .push(workload);
    }

    pub fn set_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .secrets
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), data);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(namespace)
            .and_then(|s| s.get(name))
            .cloned()
    }

    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(namespace)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every exec of `program` exit with `code`.
    pub fn fail_exec(&self, program: &str, code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .exec_failures
            .insert(program.to_string(), (code, stderr.to_string()));
    }

    pub fn fail_list_workloads(&self, namespace: &str) {
        self.state
            .lock()
            .unwrap()
            .unlistable
            .insert(namespace.to_string());
    }

    pub fn fail_apply(&self, secret_name: &str) {
        self.state
            .lock()
            .unwrap()
            .apply_failures
            .insert(secret_name.to_string());
    }

    pub fn fail_copy_to_workload(&self) {
        self.state.lock().unwrap().fail_copy_to = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.state.lock().unwrap().applies
    }

    /// Host path behind `remote` inside the pod filesystem.
    pub fn pod_path(&self, namespace: &str, pod: &str, remote: &str) -> PathBuf {
        let mut pods = self.pods.lock().unwrap();
        let root = pods
            .entry((namespace.to_string(), pod.to_string()))
            .or_insert_with(|| TempDir::new().unwrap());
        root.path().join(remote.trim_start_matches('/'))
    }

    pub fn write_pod_file(&self, namespace: &str, pod: &str, remote: &str, contents: &[u8]) {
        let path = self.pod_path(namespace, pod, remote);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn known_pod(&self, target: &WorkloadRef) -> bool {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&target.namespace)
            .map(|pods| pods.iter().any(|w| w.name == target.pod))
            .unwrap_or(false)
    }

    fn transfer_error(target: &WorkloadRef, path: &str, reason: impl ToString) -> BackupError {
        BackupError::FileTransferFailed {
            workload: target.to_string(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Recursively copy the contents of `from` into `to`.
pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).unwrap();
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .find_map(|arg| arg.strip_prefix(flag).and_then(|v| v.strip_prefix('=')))
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.record("list_namespaces".to_string());
        Ok(self.state.lock().unwrap().namespaces.clone())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        self.record(format!("list_workloads {}", namespace));
        let state = self.state.lock().unwrap();
        if state.unlistable.contains(namespace) {
            return Err(BackupError::Config(format!(
                "pods is forbidden in namespace {}",
                namespace
            )));
        }
        Ok(state.workloads.get(namespace).cloned().unwrap_or_default())
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.record(format!("read_secret {}/{}", namespace, name));
        self.secret(namespace, name).ok_or_else(|| {
            BackupError::Config(format!("secret {}/{} not found", namespace, name))
        })
    }

    async fn list_secret_names(&self, namespace: &str) -> Result<Vec<String>> {
        self.record(format!("list_secret_names {}", namespace));
        Ok(self.secret_names(namespace))
    }

    async fn secret_manifest(&self, namespace: &str, name: &str) -> Result<String> {
        let data = self.secret(namespace, name).ok_or_else(|| {
            BackupError::Config(format!("secret {}/{} not found", namespace, name))
        })?;
        let manifest = SecretManifest {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata: SecretMetadata {
                name: name.to_string(),
            },
            string_data: data
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v).to_string()))
                .collect(),
        };
        Ok(serde_yaml::to_string(&manifest)?)
    }

    async fn copy_from_workload(
        &self,
        target: &WorkloadRef,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<()> {
        self.record(format!("copy_from {} {}", target, remote_dir));
        if !self.known_pod(target) {
            return Err(Self::transfer_error(target, remote_dir, "pod not found"));
        }
        let source = self.pod_path(&target.namespace, &target.pod, remote_dir);
        if !source.is_dir() {
            return Err(Self::transfer_error(
                target,
                remote_dir,
                "tar: No such file or directory",
            ));
        }
        copy_tree(&source, local_dir).map_err(|e| Self::transfer_error(target, remote_dir, e))
    }

    async fn copy_to_workload(
        &self,
        target: &WorkloadRef,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()> {
        self.record(format!("copy_to {} {}", target, remote_dir));
        let fail_copy_to = self.state.lock().unwrap().fail_copy_to;
        if fail_copy_to || !self.known_pod(target) {
            return Err(Self::transfer_error(target, remote_dir, "connection reset"));
        }
        let dest = self.pod_path(&target.namespace, &target.pod, remote_dir);
        copy_tree(local_dir, &dest).map_err(|e| Self::transfer_error(target, remote_dir, e))
    }

    async fn exec(&self, target: &WorkloadRef, command: &[String]) -> Result<ExecOutput> {
        let program = command.first().cloned().unwrap_or_default();
        self.record(format!("exec {} {}", target, program));

        if let Some((code, stderr)) = self.state.lock().unwrap().exec_failures.get(&program) {
            return Ok(ExecOutput {
                exit_code: *code,
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            });
        }

        let pod_path = |p: &str| self.pod_path(&target.namespace, &target.pod, p);
        let failed = |code: i32, msg: String| ExecOutput {
            exit_code: code,
            stdout: Vec::new(),
            stderr: msg.into_bytes(),
        };

        let output = match program.as_str() {
            "mongodump" => {
                let out = flag_value(command, "--out").unwrap_or("dump");
                let db = flag_value(command, "--db").unwrap_or("test");
                let state = pod_path(DB_STATE_DIR);
                std::fs::create_dir_all(&state)?;
                copy_tree(&state, &pod_path(out).join(db))?;
                ExecOutput::default()
            }
            "mongorestore" => {
                let dump = command.last().cloned().unwrap_or_default();
                let source = pod_path(&dump);
                let Some(db_dir) = std::fs::read_dir(&source)
                    .ok()
                    .and_then(|mut entries| entries.next())
                    .and_then(|e| e.ok())
                    .map(|e| e.path())
                else {
                    return Ok(failed(1, format!("no dump found under {}", dump)));
                };
                let state = pod_path(DB_STATE_DIR);
                let _ = std::fs::remove_dir_all(&state);
                copy_tree(&db_dir, &state)?;
                ExecOutput::default()
            }
            "rm" => {
                let path = pod_path(command.last().map(String::as_str).unwrap_or_default());
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                ExecOutput::default()
            }
            "chmod" => {
                let path = command.last().cloned().unwrap_or_default();
                if pod_path(&path).is_file() {
                    ExecOutput::default()
                } else {
                    failed(1, format!("chmod: cannot access '{}'", path))
                }
            }
            script if pod_path(script).is_file() => ExecOutput::default(),
            other => failed(127, format!("sh: {}: not found", other)),
        };
        Ok(output)
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<()> {
        let parsed: SecretManifest = serde_yaml::from_str(manifest)?;
        self.record(format!("apply {}/{}", namespace, parsed.metadata.name));

        let mut state = self.state.lock().unwrap();
        if state.apply_failures.contains(&parsed.metadata.name) {
            return Err(BackupError::Config(format!(
                "admission webhook denied {}",
                parsed.metadata.name
            )));
        }
        state.applies += 1;
        let data = parsed
            .string_data
            .into_iter()
            .map(|(k, v)| (k, v.into_bytes()))
            .collect();
        state
            .secrets
            .entry(namespace.to_string())
            .or_default()
            .insert(parsed.metadata.name, data);
        Ok(())
    }
}
