#![allow(dead_code)]

pub mod cluster;
pub mod store;

use std::path::Path;

use platform_backup::Config;

pub use cluster::{MockClusterClient, DB_STATE_DIR};
pub use store::MockObjectStore;

pub const ROLE_LABEL: &str = "app.kubernetes.io/name";
pub const REPO_POD: &str = "cfgsvc-0";
pub const DB_POD: &str = "db-0";

/// Config pointing at `work_dir` with storage credentials filled in.
pub fn test_config(work_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.access_key_id = Some("test-key".to_string());
    config.storage.secret_access_key = Some("test-secret".to_string());
    config.storage.endpoint_url = Some("http://127.0.0.1:9000".to_string());
    config.backup.work_dir = work_dir.to_path_buf();
    config.timeouts.remote_op_secs = 5;
    config
}

/// A complete instance in `namespace`: both workloads, repository files,
/// database contents and credential secrets.
pub fn seed_instance(cluster: &MockClusterClient, namespace: &str) {
    cluster.add_pod(namespace, REPO_POD, &[(ROLE_LABEL, "configuration-service")]);
    cluster.add_pod(namespace, DB_POD, &[(ROLE_LABEL, "mongodb")]);
    cluster.add_pod(namespace, "nats-0", &[(ROLE_LABEL, "nats")]);

    cluster.write_pod_file(
        namespace,
        REPO_POD,
        "/data/config/podtato/shipyard.yaml",
        format!("project: podtato\nowner: {}\n", namespace).as_bytes(),
    );
    cluster.write_pod_file(
        namespace,
        REPO_POD,
        "/data/config/podtato/.git/HEAD",
        b"ref: refs/heads/master\n",
    );
    cluster.write_pod_file(
        namespace,
        DB_POD,
        &format!("{}/projects.bson", DB_STATE_DIR),
        format!("projects of {}", namespace).as_bytes(),
    );

    cluster.set_secret(
        namespace,
        "mongodb-credentials",
        &[
            ("user", "keptn"),
            ("password", "s3cr3t"),
            ("admin_password", "adm1n"),
        ],
    );
    cluster.set_secret(
        namespace,
        "git-credentials-podtato",
        &[("git-credentials", "{\"user\":\"bot\",\"token\":\"abc\"}")],
    );
    cluster.set_secret(namespace, "unrelated-tls", &[("tls.crt", "cert")]);
}
