mod common;

use common::{seed_instance, test_config, MockClusterClient, DB_POD, REPO_POD, ROLE_LABEL};
use platform_backup::discovery::{discover, resolve_instance, Instance, Scope};
use platform_backup::BackupError;
use tempfile::TempDir;

#[tokio::test]
async fn test_discovers_only_complete_instances() {
    let work = TempDir::new().unwrap();
    let config = test_config(work.path());
    let cluster = MockClusterClient::new();

    seed_instance(&cluster, "acme");
    seed_instance(&cluster, "globex");
    cluster.add_pod("half", REPO_POD, &[(ROLE_LABEL, "configuration-service")]);
    cluster.add_pod("kube-system", "coredns-0", &[("k8s-app", "kube-dns")]);
    cluster.add_namespace("default");

    let instances = discover(&cluster, &config, &Scope::AllNamespaces).await.unwrap();

    assert_eq!(
        instances,
        vec![
            Instance {
                name: "acme".to_string(),
                config_service_ref: REPO_POD.to_string(),
                data_store_ref: DB_POD.to_string(),
            },
            Instance {
                name: "globex".to_string(),
                config_service_ref: REPO_POD.to_string(),
                data_store_ref: DB_POD.to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_unlistable_namespace_is_skipped() {
    let work = TempDir::new().unwrap();
    let config = test_config(work.path());
    let cluster = MockClusterClient::new();

    seed_instance(&cluster, "acme");
    seed_instance(&cluster, "restricted");
    cluster.fail_list_workloads("restricted");

    let instances = discover(&cluster, &config, &Scope::AllNamespaces).await.unwrap();
    let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["acme"]);
}

#[tokio::test]
async fn test_single_namespace_scope_propagates_errors() {
    let work = TempDir::new().unwrap();
    let config = test_config(work.path());
    let cluster = MockClusterClient::new();
    cluster.add_namespace("restricted");
    cluster.fail_list_workloads("restricted");

    let result = discover(&cluster, &config, &Scope::Namespace("restricted".to_string())).await;
    assert!(result.is_err());
    assert!(!cluster.calls().contains(&"list_namespaces".to_string()));
}

#[tokio::test]
async fn test_resolve_reports_missing_role() {
    let work = TempDir::new().unwrap();
    let config = test_config(work.path());
    let cluster = MockClusterClient::new();
    cluster.add_pod("acme", REPO_POD, &[(ROLE_LABEL, "configuration-service")]);

    match resolve_instance(&cluster, &config, "acme").await {
        Err(BackupError::DiscoveryIncomplete { namespace, missing }) => {
            assert_eq!(namespace, "acme");
            assert_eq!(missing, "mongodb");
        }
        other => panic!("expected DiscoveryIncomplete, got {:?}", other),
    }

    match resolve_instance(&cluster, &config, "nowhere").await {
        Err(BackupError::DiscoveryIncomplete { namespace, .. }) => {
            assert_eq!(namespace, "nowhere");
        }
        other => panic!("expected DiscoveryIncomplete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resolve_picks_last_duplicate() {
    let work = TempDir::new().unwrap();
    let config = test_config(work.path());
    let cluster = MockClusterClient::new();
    seed_instance(&cluster, "acme");
    cluster.add_pod("acme", "db-1", &[(ROLE_LABEL, "mongodb")]);

    let instance = resolve_instance(&cluster, &config, "acme").await.unwrap();
    assert_eq!(instance.data_store_ref, "db-1");
    assert_eq!(instance.config_service_ref, REPO_POD);
}
