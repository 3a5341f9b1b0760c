//! Container backend abstraction.
//!
//! The runtime drives exactly one [`ContainerBackend`] per process. Two
//! implementations ship:
//!
//! | Backend | Target | State encoding |
//! |---------|--------|----------------|
//! | [`DaemonBackend`] | container daemon on one host | containers + in-process registration records |
//! | [`ClusterBackend`] | cluster scheduler | registration objects + pods |
//!
//! Both present the same external contract; they differ only in how the
//! service state machine is encoded. The cluster variant represents every
//! lifecycle state as a first-class object; the daemon variant cannot retain
//! a logical registration without a container, so it emulates the STOPPED
//! tombstone by retaining the registration record alone.
//!
//! # Contract
//!
//! - Bulk operations return a [`BulkResult`]: the set of identifiers that
//!   succeeded and a per-identifier error map. The call itself fails only if
//!   the request could not be issued at all.
//! - Operations are idempotent with respect to already-desired state where
//!   semantically possible; destroying a missing object surfaces a
//!   not-found error that callers demote to a no-op.
//! - Every list/stop/destroy operation accepts a filter whose fields are
//!   combined by AND; an empty filter matches everything.
//! - Every object the backend creates carries the stable label keys from
//!   [`crate::constants`] so objects survive runtime restarts.

mod cluster;
mod daemon;
pub mod labels;

pub use cluster::ClusterBackend;
pub use daemon::DaemonBackend;

use crate::enclave::EnclaveId;
use crate::error::{Error, Result};
use crate::network::Subnet;
use crate::service::{ServiceConfig, ServiceGuid, ServiceId, ServiceRegistration, ServiceStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Result Types
// =============================================================================

/// Outcome of a bulk operation: which identifiers succeeded, and the error
/// for each identifier that did not.
///
/// "Could not issue the request" and "one item failed" are never conflated:
/// the former is the `Err` of the call itself, the latter lives here.
#[derive(Debug, Default)]
pub struct BulkResult<K: Ord> {
    /// Identifiers the operation succeeded for.
    pub successes: BTreeSet<K>,
    /// Per-identifier errors for the rest.
    pub failures: BTreeMap<K, Error>,
}

impl<K: Ord> BulkResult<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            successes: BTreeSet::new(),
            failures: BTreeMap::new(),
        }
    }

    /// True when no item failed.
    #[must_use]
    pub fn is_all_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What `start_service` hands back once a container is attached.
#[derive(Debug, Clone)]
pub struct StartedService {
    /// Public (outside-of-enclave) IP where published ports are reachable,
    /// if any port was published.
    pub maybe_public_ip: Option<Ipv4Addr>,
    /// Port-id → public port, mirroring the private port key set once
    /// publication is known.
    pub public_ports: BTreeMap<String, crate::port_spec::PortSpec>,
}

/// Captured output of an exec inside a service or sidecar.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code of the argv.
    pub exit_code: i32,
    /// Interleaved stdout+stderr, bounded by
    /// [`crate::constants::MAX_EXEC_OUTPUT_BYTES`].
    pub output: String,
}

/// Handle to an enclave network created on the backend.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub enclave_id: EnclaveId,
    /// Backend-native identifier (daemon network id, cluster namespace).
    pub backend_id: String,
    pub subnet: Subnet,
    pub partitioning_enabled: bool,
}

/// Handle to a files-artifact volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    /// Backend-native volume name.
    pub name: String,
    /// The artifact the volume was expanded from.
    pub artifact_uuid: String,
}

/// Handle to a traffic-shaping sidecar.
#[derive(Debug, Clone)]
pub struct SidecarHandle {
    /// The service whose network namespace the sidecar shares.
    pub service_guid: ServiceGuid,
    /// Backend-native container identifier.
    pub backend_id: String,
}

/// A service as the backend sees it (reconstructed from labels).
#[derive(Debug, Clone)]
pub struct BackendService {
    pub registration: ServiceRegistration,
    pub status: ServiceStatus,
}

// =============================================================================
// Filters
// =============================================================================

/// Filter over services. Fields are ANDed; an empty field matches all.
#[derive(Debug, Clone, Default)]
pub struct ServiceFilters {
    pub ids: BTreeSet<ServiceId>,
    pub guids: BTreeSet<ServiceGuid>,
    pub statuses: BTreeSet<ServiceStatus>,
}

impl ServiceFilters {
    /// Matches every service.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches one guid.
    #[must_use]
    pub fn one_guid(guid: ServiceGuid) -> Self {
        Self {
            guids: BTreeSet::from([guid]),
            ..Self::default()
        }
    }

    /// AND-combined match; empty fields are wildcards.
    #[must_use]
    pub fn matches(&self, registration: &ServiceRegistration, status: ServiceStatus) -> bool {
        (self.ids.is_empty() || self.ids.contains(&registration.id))
            && (self.guids.is_empty() || self.guids.contains(&registration.guid))
            && (self.statuses.is_empty() || self.statuses.contains(&status))
    }
}

// =============================================================================
// The Backend Trait
// =============================================================================

/// Uniform capability set over containers, networks, volumes and sidecars.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the service network calls them
/// concurrently from batch fan-outs.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Short backend name for logs ("daemon", "cluster", "in-memory").
    fn name(&self) -> &'static str;

    // =========================================================================
    // Network
    // =========================================================================

    /// Creates the enclave's private network.
    async fn create_network(
        &self,
        enclave_id: &EnclaveId,
        subnet: &Subnet,
        partitioning_enabled: bool,
    ) -> Result<NetworkHandle>;

    /// Destroys the enclave's network. Missing network is a not-found error
    /// (callers demote it to a no-op).
    async fn destroy_network(&self, enclave_id: &EnclaveId) -> Result<()>;

    /// Lists runtime-owned networks.
    async fn list_networks(&self) -> Result<Vec<NetworkHandle>>;

    // =========================================================================
    // Service Lifecycle
    // =========================================================================

    /// Persists a registration: the guid exists, the private IP is reserved,
    /// no container is attached yet.
    async fn register_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
    ) -> Result<()>;

    /// Attaches a container to a registration, opening the declared private
    /// ports and publishing public ports per the backend's policy.
    ///
    /// Starting a service that is already running is not an error: the
    /// running handle is returned unchanged.
    ///
    /// `maybe_static_public_ports` in the config is a hint honored by the
    /// daemon backend only; the cluster backend ignores it.
    async fn start_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<StartedService>;

    /// Stops matching services' containers, keeping registrations as
    /// tombstones.
    async fn stop_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        stop_timeout: Duration,
    ) -> Result<BulkResult<ServiceGuid>>;

    /// Removes matching services' containers and registrations.
    async fn destroy_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BulkResult<ServiceGuid>>;

    /// Lists services the backend knows about in this enclave.
    async fn list_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<Vec<BackendService>>;

    /// Pauses every process in a running service.
    ///
    /// The cluster backend refuses this with [`Error::NotSupported`].
    async fn pause_service(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Result<()>;

    /// Resumes a paused service.
    async fn unpause_service(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Result<()>;

    // =========================================================================
    // Exec / Copy / Logs
    // =========================================================================

    /// Runs an argv inside a running service, capturing exit code and
    /// bounded interleaved output.
    async fn exec(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        argv: &[String],
    ) -> Result<ExecOutput>;

    /// Streams a tar of `path` from a running service.
    async fn copy_from_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        path: &str,
    ) -> Result<Vec<u8>>;

    /// Fetches log lines from matching services.
    async fn get_service_logs(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BTreeMap<ServiceGuid, Vec<String>>>;

    // =========================================================================
    // Files-Artifact Volumes
    // =========================================================================

    /// Creates an empty volume for a files artifact.
    async fn create_artifact_volume(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuid: &str,
    ) -> Result<VolumeHandle>;

    /// Expands a stored tar.gz into the volume via an expander helper
    /// container. On failure the implementation deletes the partial volume.
    async fn expand_artifact_into_volume(
        &self,
        enclave_id: &EnclaveId,
        artifact_tgz: &Path,
        volume: &VolumeHandle,
    ) -> Result<()>;

    /// Destroys matching artifact volumes.
    async fn destroy_artifact_volumes(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuids: &BTreeSet<String>,
    ) -> Result<BulkResult<String>>;

    // =========================================================================
    // Sidecars
    // =========================================================================

    /// Creates a sidecar container sharing the network namespace of the
    /// given service.
    ///
    /// The cluster backend refuses this with [`Error::NotSupported`]: its
    /// scheduler cannot attach a container to a running pod's namespace.
    async fn create_sidecar(
        &self,
        enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> Result<SidecarHandle>;

    /// Runs a privileged shell command inside a sidecar.
    async fn exec_in_sidecar(
        &self,
        enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
        shell_command: &str,
    ) -> Result<ExecOutput>;

    /// Destroys matching sidecars.
    async fn destroy_sidecars(
        &self,
        enclave_id: &EnclaveId,
        service_guids: &BTreeSet<ServiceGuid>,
    ) -> Result<BulkResult<ServiceGuid>>;

    // =========================================================================
    // Images
    // =========================================================================

    /// Fetches an image. Callers treat failures as transient: they warn and
    /// continue with whatever is cached.
    async fn pull_image(&self, image: &str) -> Result<()>;
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Filters a destroy/stop outcome: not-found item errors become successes,
/// everything else stays an error.
pub fn demote_not_found<K: Ord + Clone>(mut result: BulkResult<K>) -> BulkResult<K> {
    let mut demoted = Vec::new();
    for (key, err) in &result.failures {
        if err.is_not_found() {
            demoted.push(key.clone());
        }
    }
    for key in demoted {
        result.failures.remove(&key);
        result.successes.insert(key);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registration(id: &str, guid: &str) -> ServiceRegistration {
        ServiceRegistration {
            guid: ServiceGuid::from_string(guid),
            id: ServiceId::new(id),
            enclave_id: "test-enclave".to_string(),
            private_ip: Ipv4Addr::new(10, 96, 0, 7),
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filters = ServiceFilters::all();
        assert!(filters.matches(&registration("db", "db-1"), ServiceStatus::Running));
        assert!(filters.matches(&registration("web", "web-1"), ServiceStatus::Stopped));
    }

    #[test]
    fn test_filter_fields_are_anded() {
        let reg = registration("db", "db-1");
        let mut filters = ServiceFilters::all();
        filters.ids.insert(ServiceId::new("db"));
        filters.statuses.insert(ServiceStatus::Running);

        assert!(filters.matches(&reg, ServiceStatus::Running));
        // id matches but status does not
        assert!(!filters.matches(&reg, ServiceStatus::Stopped));
        // status matches but id does not
        assert!(!filters.matches(&registration("web", "web-1"), ServiceStatus::Running));
    }

    #[test]
    fn test_demote_not_found() {
        let mut result: BulkResult<String> = BulkResult::new();
        result.successes.insert("a".to_string());
        result.failures.insert(
            "b".to_string(),
            Error::ServiceNotFound("b".to_string()),
        );
        result.failures.insert(
            "c".to_string(),
            Error::DestroyFailed {
                guid: "c".to_string(),
                reason: "daemon exploded".to_string(),
            },
        );

        let result = demote_not_found(result);
        assert!(result.successes.contains("a"));
        assert!(result.successes.contains("b"));
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures.contains_key("c"));
    }
}
