//! Integration tests for the service network.
//!
//! All tests run against the in-memory backend; they exercise the network's
//! locking, IP allocation, batch semantics and partition enforcement
//! without a container daemon.

mod common;

use common::InMemoryBackend;
use enclaverun::enclave::{EnclaveId, EnclaveManager};
use enclaverun::network::{
    PartitionConnection, PartitionConnectionId, PartitionId, ServiceNetwork, Subnet,
};
use enclaverun::port_spec::PortSpec;
use enclaverun::service::{ServiceConfig, ServiceId, ServiceStatus};
use enclaverun::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

fn test_network(partitioning_enabled: bool) -> (Arc<InMemoryBackend>, ServiceNetwork) {
    let backend = Arc::new(InMemoryBackend::new());
    let network = ServiceNetwork::new(
        EnclaveId::new("test-enclave"),
        Subnet::new("10.0.0.0".parse().unwrap(), 24).unwrap(),
        partitioning_enabled,
        HashSet::new(),
        backend.clone(),
    );
    (backend, network)
}

fn config(image: &str) -> ServiceConfig {
    ServiceConfig {
        image: image.to_string(),
        ..ServiceConfig::default()
    }
}

fn config_with_port(image: &str, port_id: &str, number: u16) -> ServiceConfig {
    let mut cfg = config(image);
    cfg.private_ports
        .insert(port_id.to_string(), PortSpec::tcp(number).unwrap());
    cfg
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_register_reserves_unique_stable_ips() {
    let (_backend, network) = test_network(false);

    let (ip_a, dir_a) = network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    let (ip_b, _) = network
        .register_service(&ServiceId::new("b"), None)
        .await
        .unwrap();

    assert_ne!(ip_a, ip_b);
    assert!(dir_a.starts_with("services/a-"));

    // The IP survives the whole lifecycle unchanged.
    network
        .start_service(&ServiceId::new("a"), config("app"))
        .await
        .unwrap();
    let info = network.get_service_info(&ServiceId::new("a")).await.unwrap();
    assert_eq!(info.registration.private_ip, ip_a);
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (_backend, network) = test_network(false);
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    let err = network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceAlreadyRegistered(_)));
}

#[tokio::test]
async fn test_register_into_unknown_partition_fails_and_leaks_nothing() {
    let (_backend, network) = test_network(true);
    let err = network
        .register_service(&ServiceId::new("a"), Some(PartitionId::new("ghost")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionNotFound(_)));

    // The id and its IP are free again.
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
}

// =============================================================================
// Start
// =============================================================================

#[tokio::test]
async fn test_start_publishes_ports() {
    let (_backend, network) = test_network(false);
    network
        .register_service(&ServiceId::new("db"), None)
        .await
        .unwrap();
    let service = network
        .start_service(&ServiceId::new("db"), config_with_port("postgres", "pg", 5432))
        .await
        .unwrap();

    assert_eq!(service.status, ServiceStatus::Running);
    assert_eq!(service.private_ports["pg"].number, 5432);
    // The mock publishes on private+1; both maps share a key set.
    assert_eq!(service.maybe_public_ports["pg"].number, 5433);
    assert!(service.maybe_public_ip.is_some());
}

#[tokio::test]
async fn test_start_unregistered_service_fails() {
    let (_backend, network) = test_network(false);
    let err = network
        .start_service(&ServiceId::new("ghost"), config("app"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound(_)));
}

#[tokio::test]
async fn test_batch_start_partial_failure_keeps_successes() {
    let (backend, network) = test_network(false);
    backend.fail_starts_of("broken-image");

    for id in ["a", "b"] {
        network
            .register_service(&ServiceId::new(id), None)
            .await
            .unwrap();
    }
    let mut batch = BTreeMap::new();
    batch.insert(ServiceId::new("a"), config("good-image"));
    batch.insert(ServiceId::new("b"), config("broken-image"));

    let (successes, failures) = network.start_services(batch).await.unwrap();
    assert!(successes.contains_key(&ServiceId::new("a")));
    assert!(failures.contains_key(&ServiceId::new("b")));

    // a is running, b is at most registered.
    let info_a = network.get_service_info(&ServiceId::new("a")).await.unwrap();
    assert_eq!(info_a.status, ServiceStatus::Running);
    let info_b = network.get_service_info(&ServiceId::new("b")).await.unwrap();
    assert_eq!(info_b.status, ServiceStatus::Registered);
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test]
async fn test_remove_returns_guid_and_frees_identity() {
    let (_backend, network) = test_network(false);
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    network
        .start_service(&ServiceId::new("a"), config("app"))
        .await
        .unwrap();

    let guid = network
        .remove_service(&ServiceId::new("a"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(guid.as_str().starts_with("a-"));

    assert!(matches!(
        network.get_service_info(&ServiceId::new("a")).await,
        Err(Error::ServiceNotFound(_))
    ));
    // The id is registrable again with a fresh guid.
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_destroy_all_twice_is_idempotent() {
    let (_backend, network) = test_network(false);
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    network
        .start_service(&ServiceId::new("a"), config("app"))
        .await
        .unwrap();

    let first = network
        .destroy_all_services(Duration::from_secs(0))
        .await
        .unwrap();
    assert!(first.is_all_success());
    let second = network
        .destroy_all_services(Duration::from_secs(0))
        .await
        .unwrap();
    assert!(second.is_all_success());
    assert!(network.services().await.is_empty());
}

// =============================================================================
// Partitioning
// =============================================================================

async fn two_running_services(network: &ServiceNetwork) {
    for id in ["a", "b"] {
        network
            .register_service(&ServiceId::new(id), None)
            .await
            .unwrap();
        network
            .start_service(&ServiceId::new(id), config("app"))
            .await
            .unwrap();
    }
}

fn split_topology(
    loss: f32,
) -> (
    BTreeMap<PartitionId, BTreeSet<ServiceId>>,
    HashMap<PartitionConnectionId, PartitionConnection>,
) {
    let mut partitions = BTreeMap::new();
    partitions.insert(
        PartitionId::new("p1"),
        BTreeSet::from([ServiceId::new("a")]),
    );
    partitions.insert(
        PartitionId::new("p2"),
        BTreeSet::from([ServiceId::new("b")]),
    );
    let connections = HashMap::from([(
        PartitionConnectionId::new(PartitionId::new("p1"), PartitionId::new("p2")),
        PartitionConnection {
            packet_loss_percentage: loss,
        },
    )]);
    (partitions, connections)
}

#[tokio::test]
async fn test_repartition_pushes_exact_blocklists() {
    let (backend, network) = test_network(true);
    two_running_services(&network).await;

    let ip_a = network
        .get_service_info(&ServiceId::new("a"))
        .await
        .unwrap()
        .registration
        .private_ip;
    let ip_b = network
        .get_service_info(&ServiceId::new("b"))
        .await
        .unwrap()
        .registration
        .private_ip;
    let guid_a = network
        .get_service_info(&ServiceId::new("a"))
        .await
        .unwrap()
        .registration
        .guid;

    let (partitions, connections) = split_topology(100.0);
    let result = network
        .repartition(partitions, connections, PartitionConnection::open())
        .await
        .unwrap();
    assert!(result.is_all_success());

    // a's live chain drops exactly b's IP, in and out.
    let commands = backend.sidecar_commands(&guid_a);
    let last = commands.last().unwrap();
    assert!(last.contains(&format!("-s {ip_b} -j DROP")));
    assert!(last.contains(&format!("-d {ip_b} -j DROP")));
    assert!(!last.contains(&ip_a.to_string()));

    // Reverse to loss=0: the rebuilt chain carries no drop rules.
    let (partitions, connections) = split_topology(0.0);
    network
        .repartition(partitions, connections, PartitionConnection::open())
        .await
        .unwrap();
    let commands = backend.sidecar_commands(&guid_a);
    let last = commands.last().unwrap();
    assert!(!last.contains("DROP"));
}

#[tokio::test]
async fn test_repartition_alternates_filter_chains() {
    let (backend, network) = test_network(true);
    two_running_services(&network).await;
    let guid_a = network
        .get_service_info(&ServiceId::new("a"))
        .await
        .unwrap()
        .registration
        .guid;

    // Startup initialized chain 1; the first update rebuilds chain 2, the
    // next one chain 1 again.
    let (partitions, connections) = split_topology(100.0);
    network
        .repartition(partitions.clone(), connections.clone(), PartitionConnection::open())
        .await
        .unwrap();
    let (partitions2, connections2) = split_topology(0.0);
    network
        .repartition(partitions2, connections2, PartitionConnection::open())
        .await
        .unwrap();

    let commands = backend.sidecar_commands(&guid_a);
    let updates: Vec<&String> = commands
        .iter()
        .filter(|c| c.starts_with("iptables -F"))
        .collect();
    assert!(updates.len() >= 3);
    let chain_of = |cmd: &str| {
        if cmd.contains("ENCLAVERUN1") {
            "1"
        } else {
            "2"
        }
    };
    let last_two: Vec<&str> = updates[updates.len() - 2..]
        .iter()
        .map(|c| chain_of(c))
        .collect();
    assert_ne!(last_two[0], last_two[1]);
}

#[tokio::test]
async fn test_repartition_rejected_when_partitioning_disabled() {
    let (_backend, network) = test_network(false);
    two_running_services(&network).await;

    let (partitions, connections) = split_topology(100.0);
    let err = network
        .repartition(partitions, connections, PartitionConnection::open())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitioningDisabled(_)));
}

#[tokio::test]
async fn test_repartition_requires_complete_topology() {
    let (_backend, network) = test_network(true);
    two_running_services(&network).await;

    // A topology that forgets service b.
    let mut partitions = BTreeMap::new();
    partitions.insert(
        PartitionId::new("p1"),
        BTreeSet::from([ServiceId::new("a")]),
    );
    let err = network
        .repartition(partitions, HashMap::new(), PartitionConnection::open())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTopology(_)));
}

// =============================================================================
// Exec / logs
// =============================================================================

#[tokio::test]
async fn test_exec_routes_to_running_service() {
    let (backend, network) = test_network(false);
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    network
        .start_service(&ServiceId::new("a"), config("app"))
        .await
        .unwrap();
    backend.respond_to_exec("ping", 1, "100% packet loss");

    let argv = vec!["ping".to_string(), "-c1".to_string(), "10.0.0.9".to_string()];
    let output = network.exec_command(&ServiceId::new("a"), &argv).await.unwrap();
    assert_eq!(output.exit_code, 1);
    assert!(output.output.contains("packet loss"));
    assert_eq!(backend.exec_log().len(), 1);
}

#[tokio::test]
async fn test_exec_against_stopped_service_fails() {
    let (backend, network) = test_network(false);
    let _ = backend;
    network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    let err = network
        .exec_command(&ServiceId::new("a"), &["ls".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidServiceState { .. }));
}

// =============================================================================
// Enclave manager
// =============================================================================

#[tokio::test]
async fn test_enclave_lifecycle_and_status() {
    let backend = Arc::new(InMemoryBackend::new());
    let temp = tempfile::TempDir::new().unwrap();
    let manager = EnclaveManager::new(backend.clone(), temp.path().to_path_buf());

    let enclave = manager
        .create_enclave(&EnclaveId::new("e1"), false)
        .await
        .unwrap();
    assert_eq!(
        enclave.status().await,
        enclaverun::enclave::EnclaveStatus::Empty
    );
    assert!(temp.path().join("e1").join("files-artifacts").is_dir());
    assert!(temp.path().join("e1").join("services").is_dir());
    assert!(temp.path().join("e1").join("modules").is_dir());

    enclave
        .network
        .register_service(&ServiceId::new("a"), None)
        .await
        .unwrap();
    enclave
        .network
        .start_service(&ServiceId::new("a"), config("app"))
        .await
        .unwrap();
    assert_eq!(
        enclave.status().await,
        enclaverun::enclave::EnclaveStatus::Running
    );

    manager
        .destroy_enclave(&EnclaveId::new("e1"), Duration::from_secs(0))
        .await
        .unwrap();
    assert!(!temp.path().join("e1").exists());

    // Destroying a missing enclave is a no-op.
    manager
        .destroy_enclave(&EnclaveId::new("e1"), Duration::from_secs(0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_enclaves_get_disjoint_subnets() {
    let backend = Arc::new(InMemoryBackend::new());
    let temp = tempfile::TempDir::new().unwrap();
    let manager = EnclaveManager::new(backend, temp.path().to_path_buf());

    let e1 = manager
        .create_enclave(&EnclaveId::new("e1"), false)
        .await
        .unwrap();
    let e2 = manager
        .create_enclave(&EnclaveId::new("e2"), false)
        .await
        .unwrap();
    assert_ne!(e1.enclave.subnet, e2.enclave.subnet);

    let err = manager
        .create_enclave(&EnclaveId::new("e1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EnclaveAlreadyExists(_)));
}
