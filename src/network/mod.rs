//! The in-enclave data plane.
//!
//! [`ServiceNetwork`] is the single owner of an enclave's topology: service
//! registrations, private-IP allocation, partition state and sidecars. Every
//! plan instruction and RPC that touches services goes through it, and it is
//! the only component that calls the container backend for service
//! lifecycle.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards the registration maps, the IP allocator
//! and the topology. Mutations serialize on it. Read-mostly operations
//! (exec, copy, endpoint waits) take it only to look up the target, then
//! release it before doing I/O. Batch fan-outs snapshot what they need under
//! the lock, run the backend calls unlocked, and re-acquire to apply
//! results.

pub mod http_wait;
pub mod ip_allocator;
pub mod sidecar;
pub mod topology;

pub use http_wait::{HttpWait, ProbeMethod};
pub use ip_allocator::{IpAllocator, Subnet};
pub use sidecar::Sidecar;
pub use topology::{
    PartitionConnection, PartitionConnectionId, PartitionId, PartitionTopology,
    DEFAULT_PARTITION_ID,
};

use crate::backend::{BulkResult, ContainerBackend, ExecOutput, ServiceFilters};
use crate::constants::MAX_PARALLEL_SERVICE_OPS;
use crate::enclave::EnclaveId;
use crate::error::{Error, Result};
use crate::port_spec::PortSpec;
use crate::service::{
    Service, ServiceConfig, ServiceGuid, ServiceId, ServiceRegistration, ServiceStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Everything a client needs to know about one service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub registration: ServiceRegistration,
    pub status: ServiceStatus,
    pub private_ports: BTreeMap<String, PortSpec>,
    pub maybe_public_ip: Option<Ipv4Addr>,
    pub maybe_public_ports: BTreeMap<String, PortSpec>,
    /// Where the service's scratch dir lives, relative to the enclave data
    /// dir.
    pub relative_data_dir: String,
}

/// State guarded by the network mutex.
struct NetworkState {
    services: HashMap<ServiceId, Service>,
    topology: PartitionTopology,
    ip_allocator: IpAllocator,
    sidecars: HashMap<ServiceId, Arc<Sidecar>>,
}

/// The enclave's service network.
pub struct ServiceNetwork {
    enclave_id: EnclaveId,
    partitioning_enabled: bool,
    backend: Arc<dyn ContainerBackend>,
    state: Mutex<NetworkState>,
}

impl ServiceNetwork {
    /// Creates the network for an enclave whose backend network already
    /// exists.
    ///
    /// `reserved_ips` are addresses inside the subnet the allocator must
    /// never hand out (the runtime's own address, gateway extras).
    #[must_use]
    pub fn new(
        enclave_id: EnclaveId,
        subnet: Subnet,
        partitioning_enabled: bool,
        reserved_ips: HashSet<Ipv4Addr>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            enclave_id,
            partitioning_enabled,
            backend,
            state: Mutex::new(NetworkState {
                services: HashMap::new(),
                topology: PartitionTopology::flat(),
                ip_allocator: IpAllocator::new(subnet, &reserved_ips),
                sidecars: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn enclave_id(&self) -> &EnclaveId {
        &self.enclave_id
    }

    #[must_use]
    pub fn is_partitioning_enabled(&self) -> bool {
        self.partitioning_enabled
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Reserves an identity for a service: guid, private IP, partition
    /// membership. Fails if the id is already taken in this enclave
    /// (tombstones count; ids are never reused).
    pub async fn register_service(
        &self,
        service_id: &ServiceId,
        partition: Option<PartitionId>,
    ) -> Result<(Ipv4Addr, String)> {
        let mut state = self.state.lock().await;

        if state.services.contains_key(service_id) {
            return Err(Error::ServiceAlreadyRegistered(service_id.to_string()));
        }
        let partition = partition.unwrap_or_else(PartitionId::default_partition);
        if state.topology.partition_of(service_id).is_some() {
            return Err(Error::ServiceAlreadyRegistered(service_id.to_string()));
        }

        let private_ip = state.ip_allocator.allocate()?;
        let registration = ServiceRegistration {
            guid: ServiceGuid::mint(service_id),
            id: service_id.clone(),
            enclave_id: self.enclave_id.to_string(),
            private_ip,
        };

        if let Err(e) = self
            .backend
            .register_service(&self.enclave_id, &registration)
            .await
        {
            if let Err(release_err) = state.ip_allocator.release(private_ip) {
                warn!(ip = %private_ip, error = %release_err, "failed to release IP after registration failure");
            }
            return Err(e);
        }

        if let Err(e) = state.topology.add_service(service_id.clone(), &partition) {
            // Roll the registration back; the partition did not exist.
            let filters = ServiceFilters::one_guid(registration.guid.clone());
            if let Err(destroy_err) = self.backend.destroy_services(&self.enclave_id, &filters).await
            {
                warn!(guid = %registration.guid, error = %destroy_err, "failed to roll back registration");
            }
            if let Err(release_err) = state.ip_allocator.release(private_ip) {
                warn!(ip = %private_ip, error = %release_err, "failed to release IP after topology failure");
            }
            return Err(e);
        }

        let relative_data_dir = registration.relative_data_dir();
        info!(
            service = %service_id,
            guid = %registration.guid,
            ip = %private_ip,
            %partition,
            "registered service"
        );
        state
            .services
            .insert(service_id.clone(), Service::registered(registration));
        Ok((private_ip, relative_data_dir))
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts one previously-registered service.
    pub async fn start_service(
        &self,
        service_id: &ServiceId,
        config: ServiceConfig,
    ) -> Result<Service> {
        let mut batch = BTreeMap::new();
        batch.insert(service_id.clone(), config);
        let (mut successes, mut failures) = self.start_services(batch).await?;
        if let Some(service) = successes.remove(service_id) {
            return Ok(service);
        }
        Err(failures.remove(service_id).unwrap_or_else(|| {
            Error::Internal(format!("service '{service_id}' missing from batch result"))
        }))
    }

    /// Starts a batch of registered services.
    ///
    /// Every id must already be registered; a violated precondition fails
    /// the whole call before any container starts. Startup then fans out in
    /// parallel (bounded) and each service succeeds or fails independently:
    /// successes stay running, a failed service is left at most registered
    /// with its partial container torn down.
    pub async fn start_services(
        &self,
        configs: BTreeMap<ServiceId, ServiceConfig>,
    ) -> Result<(BTreeMap<ServiceId, Service>, BTreeMap<ServiceId, Error>)> {
        if configs.is_empty() {
            return Ok((BTreeMap::new(), BTreeMap::new()));
        }
        if configs.len() > crate::constants::MAX_BATCH_START_SERVICES {
            return Err(Error::BackendRequestFailed(format!(
                "cannot start {} services in one batch (limit {})",
                configs.len(),
                crate::constants::MAX_BATCH_START_SERVICES
            )));
        }

        // Snapshot registrations and blocklists under the lock; all I/O
        // happens after it is released.
        let mut snapshot: Vec<(ServiceId, ServiceRegistration, ServiceConfig)> = Vec::new();
        let mut blocked_ips_by_service: HashMap<ServiceId, BTreeSet<Ipv4Addr>> = HashMap::new();
        {
            let state = self.state.lock().await;
            for (service_id, config) in &configs {
                let service = state
                    .services
                    .get(service_id)
                    .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
                if service.status != ServiceStatus::Registered {
                    return Err(Error::InvalidServiceState {
                        guid: service.registration.guid.to_string(),
                        state: service.status.to_string(),
                        expected: ServiceStatus::Registered.to_string(),
                    });
                }
                snapshot.push((
                    service_id.clone(),
                    service.registration.clone(),
                    config.clone(),
                ));
                blocked_ips_by_service.insert(
                    service_id.clone(),
                    self.resolve_blocked_ips(&state, service_id),
                );
            }
        }

        // Bounded fan-out; results come home on a channel.
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_SERVICE_OPS));
        let (results_tx, mut results_rx) =
            mpsc::channel::<(ServiceId, Result<StartOutcome>)>(snapshot.len());
        let expected = snapshot.len();

        for (service_id, registration, config) in snapshot {
            let backend = Arc::clone(&self.backend);
            let enclave_id = self.enclave_id.clone();
            let partitioning_enabled = self.partitioning_enabled;
            let blocked_ips = blocked_ips_by_service
                .remove(&service_id)
                .unwrap_or_default();
            let semaphore = Arc::clone(&semaphore);
            let tx = results_tx.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = start_one_service(
                    backend,
                    enclave_id,
                    registration,
                    config,
                    partitioning_enabled,
                    blocked_ips,
                )
                .await;
                // Receiver outliving the send is guaranteed by the loop
                // below collecting exactly one result per task.
                let _ = tx.send((service_id, outcome)).await;
            });
        }
        drop(results_tx);

        let mut outcomes: Vec<(ServiceId, Result<StartOutcome>)> = Vec::with_capacity(expected);
        while let Some(result) = results_rx.recv().await {
            outcomes.push(result);
        }

        // Apply outcomes under the lock.
        let mut state = self.state.lock().await;
        let mut successes = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (service_id, outcome) in outcomes {
            match outcome {
                Ok(started) => {
                    if let Some(service) = state.services.get_mut(&service_id) {
                        service.status = ServiceStatus::Running;
                        service.container_image = Some(started.image);
                        service.private_ports = started.private_ports;
                        service.maybe_public_ip = started.maybe_public_ip;
                        service.maybe_public_ports = started.public_ports;
                        successes.insert(service_id.clone(), service.clone());
                    }
                    if let Some(sidecar) = started.sidecar {
                        state.sidecars.insert(service_id, sidecar);
                    }
                }
                Err(e) => {
                    failures.insert(service_id, e);
                }
            }
        }
        info!(
            enclave = %self.enclave_id,
            started = successes.len(),
            failed = failures.len(),
            "batch start finished"
        );
        Ok((successes, failures))
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Stops and removes a service: container and registration go away, the
    /// private IP returns to the pool, the id leaves the topology. Returns
    /// the destroyed guid.
    ///
    /// Removing an already-removed service is a not-found no-op only at the
    /// backend level; an id unknown to the network is an error.
    pub async fn remove_service(
        &self,
        service_id: &ServiceId,
        stop_timeout: Duration,
    ) -> Result<ServiceGuid> {
        let mut state = self.state.lock().await;
        let service = state
            .services
            .get(service_id)
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?
            .clone();
        let guid = service.registration.guid.clone();

        // Stop politely first so the workload gets its grace period.
        if service.status == ServiceStatus::Running {
            let filters = ServiceFilters::one_guid(guid.clone());
            let stop_result = self
                .backend
                .stop_services(&self.enclave_id, &filters, stop_timeout)
                .await?;
            if let Some((_, e)) = stop_result.failures.into_iter().next() {
                warn!(service = %service_id, error = %e, "graceful stop failed, destroying anyway");
            }
        }

        let filters = ServiceFilters::one_guid(guid.clone());
        let destroy_result = self
            .backend
            .destroy_services(&self.enclave_id, &filters)
            .await?;
        let destroy_result = crate::backend::demote_not_found(destroy_result);
        if let Some((_, e)) = destroy_result.failures.into_iter().next() {
            return Err(e);
        }

        if state.sidecars.remove(service_id).is_some() {
            let guids = BTreeSet::from([guid.clone()]);
            match self.backend.destroy_sidecars(&self.enclave_id, &guids).await {
                Ok(result) => {
                    for (sidecar_guid, e) in result.failures {
                        if !e.is_not_found() {
                            warn!(guid = %sidecar_guid, error = %e, "failed to destroy sidecar");
                        }
                    }
                }
                Err(e) => warn!(service = %service_id, error = %e, "failed to destroy sidecar"),
            }
        }

        state.topology.remove_service(service_id);
        state.services.remove(service_id);
        if let Err(e) = state.ip_allocator.release(service.registration.private_ip) {
            warn!(ip = %service.registration.private_ip, error = %e, "failed to release IP");
        }
        info!(service = %service_id, %guid, "removed service");
        Ok(guid)
    }

    /// Tears down every service. Used by enclave destroy; failures are
    /// collected, not short-circuited.
    pub async fn destroy_all_services(
        &self,
        stop_timeout: Duration,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut state = self.state.lock().await;

        let stop_result = self
            .backend
            .stop_services(&self.enclave_id, &ServiceFilters::all(), stop_timeout)
            .await?;
        for (guid, e) in stop_result.failures {
            warn!(%guid, error = %e, "graceful stop failed during teardown");
        }

        let sidecar_guids: BTreeSet<ServiceGuid> = state
            .sidecars
            .values()
            .map(|s| s.service_guid().clone())
            .collect();
        if !sidecar_guids.is_empty() {
            match self
                .backend
                .destroy_sidecars(&self.enclave_id, &sidecar_guids)
                .await
            {
                Ok(result) => {
                    for (guid, e) in result.failures {
                        if !e.is_not_found() {
                            warn!(%guid, error = %e, "failed to destroy sidecar during teardown");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "sidecar teardown request failed"),
            }
        }

        let result = self
            .backend
            .destroy_services(&self.enclave_id, &ServiceFilters::all())
            .await?;
        let result = crate::backend::demote_not_found(result);

        let state = &mut *state;
        for service in state.services.values() {
            if let Err(e) = state
                .ip_allocator
                .release(service.registration.private_ip)
            {
                debug!(ip = %service.registration.private_ip, error = %e, "IP already released");
            }
        }
        state.services.clear();
        state.sidecars.clear();
        state.topology = PartitionTopology::flat();
        Ok(result)
    }

    // =========================================================================
    // Repartition
    // =========================================================================

    /// Replaces the partition topology atomically and pushes the resulting
    /// blocklists to every sidecar in parallel.
    ///
    /// Sidecar push failures do not un-apply the topology; they come back in
    /// the result's failure map and operators repair by re-issuing the
    /// repartition.
    pub async fn repartition(
        &self,
        partition_services: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
        connections: HashMap<PartitionConnectionId, PartitionConnection>,
        default_connection: PartitionConnection,
    ) -> Result<BulkResult<ServiceId>> {
        if !self.partitioning_enabled {
            return Err(Error::PartitioningDisabled(self.enclave_id.to_string()));
        }

        let new_topology =
            PartitionTopology::new(partition_services, connections, default_connection)?;

        // Validate and install under the lock; snapshot the sidecar pushes.
        let pushes: Vec<(ServiceId, Arc<Sidecar>, BTreeSet<Ipv4Addr>)> = {
            let mut state = self.state.lock().await;

            for service_id in new_topology.services() {
                if !state.services.contains_key(service_id) {
                    return Err(Error::ServiceNotFound(service_id.to_string()));
                }
            }
            for service_id in state.services.keys() {
                if new_topology.partition_of(service_id).is_none() {
                    return Err(Error::InvalidTopology(format!(
                        "service '{service_id}' is missing from the new topology"
                    )));
                }
            }

            state.topology = new_topology;
            state
                .sidecars
                .iter()
                .map(|(service_id, sidecar)| {
                    (
                        service_id.clone(),
                        Arc::clone(sidecar),
                        self.resolve_blocked_ips(&state, service_id),
                    )
                })
                .collect()
        };

        // Parallel pushes, bounded like every other fan-out.
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_SERVICE_OPS));
        let (results_tx, mut results_rx) = mpsc::channel::<(ServiceId, Result<()>)>(
            pushes.len().max(1),
        );
        let expected = pushes.len();
        for (service_id, sidecar, blocked_ips) in pushes {
            let semaphore = Arc::clone(&semaphore);
            let tx = results_tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = sidecar.update_blocked_ips(&blocked_ips).await;
                let _ = tx.send((service_id, result)).await;
            });
        }
        drop(results_tx);

        let mut result = BulkResult::new();
        for _ in 0..expected {
            match results_rx.recv().await {
                Some((service_id, Ok(()))) => {
                    result.successes.insert(service_id);
                }
                Some((service_id, Err(e))) => {
                    result.failures.insert(service_id, e);
                }
                None => break,
            }
        }
        info!(
            enclave = %self.enclave_id,
            updated = result.successes.len(),
            failed = result.failures.len(),
            "repartition applied"
        );
        Ok(result)
    }

    // =========================================================================
    // Exec / Copy / Info / Wait
    // =========================================================================

    /// Runs an argv inside a running service. The lock is held only for the
    /// lookup.
    pub async fn exec_command(
        &self,
        service_id: &ServiceId,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let guid = self.running_guid(service_id).await?;
        self.backend.exec(&self.enclave_id, &guid, argv).await
    }

    /// Streams a tar of `path` out of a running service.
    pub async fn copy_from_service(&self, service_id: &ServiceId, path: &str) -> Result<Vec<u8>> {
        let guid = self.running_guid(service_id).await?;
        self.backend
            .copy_from_service(&self.enclave_id, &guid, path)
            .await
    }

    /// Point-in-time view of one service.
    pub async fn get_service_info(&self, service_id: &ServiceId) -> Result<ServiceInfo> {
        let state = self.state.lock().await;
        let service = state
            .services
            .get(service_id)
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
        Ok(ServiceInfo {
            registration: service.registration.clone(),
            status: service.status,
            private_ports: service.private_ports.clone(),
            maybe_public_ip: service.maybe_public_ip,
            maybe_public_ports: service.maybe_public_ports.clone(),
            relative_data_dir: service.registration.relative_data_dir(),
        })
    }

    /// Ids of every service the network knows about.
    pub async fn service_ids(&self) -> BTreeSet<ServiceId> {
        let state = self.state.lock().await;
        state.services.keys().cloned().collect()
    }

    /// Snapshot of every service record.
    pub async fn services(&self) -> Vec<Service> {
        let state = self.state.lock().await;
        state.services.values().cloned().collect()
    }

    /// Blocks until an HTTP endpoint on the service answers.
    #[allow(clippy::too_many_arguments)]
    pub async fn wait_for_http_endpoint(
        &self,
        service_id: &ServiceId,
        method: ProbeMethod,
        port: u16,
        path: &str,
        initial_delay: Duration,
        retries: u32,
        retries_delay: Duration,
        body_to_send: Option<String>,
        body_to_expect: Option<String>,
    ) -> Result<()> {
        let ip = {
            let state = self.state.lock().await;
            let service = state
                .services
                .get(service_id)
                .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
            if service.status != ServiceStatus::Running {
                return Err(Error::InvalidServiceState {
                    guid: service.registration.guid.to_string(),
                    state: service.status.to_string(),
                    expected: ServiceStatus::Running.to_string(),
                });
            }
            service.registration.private_ip
        };

        HttpWait {
            method,
            ip,
            port,
            path: path.to_string(),
            initial_delay,
            retries,
            retries_delay,
            body_to_send,
            body_to_expect,
        }
        .run()
        .await
    }

    /// Pauses every process in a running service.
    pub async fn pause_service(&self, service_id: &ServiceId) -> Result<()> {
        let guid = self.running_guid(service_id).await?;
        self.backend.pause_service(&self.enclave_id, &guid).await
    }

    /// Resumes a paused service.
    pub async fn unpause_service(&self, service_id: &ServiceId) -> Result<()> {
        let guid = self.running_guid(service_id).await?;
        self.backend.unpause_service(&self.enclave_id, &guid).await
    }

    /// Fetches log lines for matching services.
    pub async fn get_service_logs(
        &self,
        filters: &ServiceFilters,
    ) -> Result<BTreeMap<ServiceGuid, Vec<String>>> {
        self.backend
            .get_service_logs(&self.enclave_id, filters)
            .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Looks up a running service's guid, holding the lock only briefly.
    async fn running_guid(&self, service_id: &ServiceId) -> Result<ServiceGuid> {
        let state = self.state.lock().await;
        let service = state
            .services
            .get(service_id)
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
        if service.status != ServiceStatus::Running {
            return Err(Error::InvalidServiceState {
                guid: service.registration.guid.to_string(),
                state: service.status.to_string(),
                expected: ServiceStatus::Running.to_string(),
            });
        }
        Ok(service.registration.guid.clone())
    }

    /// IPs the topology says `service_id` must not reach.
    fn resolve_blocked_ips(
        &self,
        state: &NetworkState,
        service_id: &ServiceId,
    ) -> BTreeSet<Ipv4Addr> {
        state
            .topology
            .blocked_services(service_id)
            .iter()
            .filter_map(|blocked_id| {
                state
                    .services
                    .get(blocked_id)
                    .map(|s| s.registration.private_ip)
            })
            .collect()
    }
}

/// What one successful per-service start hands back to the batch collector.
struct StartOutcome {
    image: String,
    private_ports: BTreeMap<String, PortSpec>,
    maybe_public_ip: Option<Ipv4Addr>,
    public_ports: BTreeMap<String, PortSpec>,
    sidecar: Option<Arc<Sidecar>>,
}

/// Starts one service: best-effort image pull, container start, and (when
/// partitioning is on) sidecar creation with the initial blocklist.
async fn start_one_service(
    backend: Arc<dyn ContainerBackend>,
    enclave_id: EnclaveId,
    registration: ServiceRegistration,
    config: ServiceConfig,
    partitioning_enabled: bool,
    blocked_ips: BTreeSet<Ipv4Addr>,
) -> Result<StartOutcome> {
    // Pull failures are transient: warn and start from whatever is cached.
    if let Err(e) = backend.pull_image(&config.image).await {
        warn!(image = %config.image, error = %e, "image pull failed, using cached image if present");
    }

    let started = backend
        .start_service(&enclave_id, &registration, &config)
        .await?;

    let sidecar = if partitioning_enabled {
        match attach_sidecar(
            &backend,
            &enclave_id,
            &registration,
            &blocked_ips,
        )
        .await
        {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                // A service that cannot be traffic-shaped must not keep
                // running unshaped; stop its container and fail the start.
                let filters = ServiceFilters::one_guid(registration.guid.clone());
                if let Err(stop_err) = backend
                    .stop_services(&enclave_id, &filters, Duration::from_secs(0))
                    .await
                {
                    warn!(guid = %registration.guid, error = %stop_err, "failed to stop service after sidecar failure");
                }
                return Err(e);
            }
        }
    } else {
        None
    };

    Ok(StartOutcome {
        image: config.image,
        private_ports: config.private_ports,
        maybe_public_ip: started.maybe_public_ip,
        public_ports: started.public_ports,
        sidecar,
    })
}

async fn attach_sidecar(
    backend: &Arc<dyn ContainerBackend>,
    enclave_id: &EnclaveId,
    registration: &ServiceRegistration,
    blocked_ips: &BTreeSet<Ipv4Addr>,
) -> Result<Arc<Sidecar>> {
    let handle = backend
        .create_sidecar(enclave_id, &registration.guid)
        .await?;
    let sidecar = Arc::new(Sidecar::new(
        registration.id.clone(),
        registration.guid.clone(),
        enclave_id.clone(),
        handle,
        Arc::clone(backend),
    ));
    sidecar.initialize().await?;
    sidecar.update_blocked_ips(blocked_ips).await?;
    Ok(sidecar)
}
