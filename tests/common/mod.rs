#![allow(dead_code)] // helpers are shared across several test crates

//! Shared test fixtures: an in-memory container backend.
//!
//! The backend tracks the same per-guid state machine the real variants do
//! but touches nothing outside the process, so the service network, plan
//! pipeline and enclave manager can be exercised without a daemon. Every
//! exec and sidecar command is recorded for assertions.

use async_trait::async_trait;
use enclaverun::backend::{
    BackendService, BulkResult, ContainerBackend, ExecOutput, NetworkHandle, ServiceFilters,
    SidecarHandle, StartedService, VolumeHandle,
};
use enclaverun::enclave::EnclaveId;
use enclaverun::network::Subnet;
use enclaverun::service::{ServiceConfig, ServiceGuid, ServiceRegistration, ServiceStatus};
use enclaverun::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct ServiceRecord {
    registration: ServiceRegistration,
    status: ServiceStatus,
    config: Option<ServiceConfig>,
}

#[derive(Debug, Default)]
struct State {
    networks: HashMap<EnclaveId, NetworkRecord>,
    services: HashMap<EnclaveId, HashMap<ServiceGuid, ServiceRecord>>,
    sidecars: HashMap<ServiceGuid, Vec<String>>,
    volumes: HashMap<EnclaveId, BTreeSet<String>>,
    expanded: Vec<String>,
    pulled_images: Vec<String>,
    exec_log: Vec<(ServiceGuid, Vec<String>)>,
}

#[derive(Debug, Clone)]
struct NetworkRecord {
    subnet: Subnet,
    partitioning_enabled: bool,
}

/// Fully in-memory [`ContainerBackend`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    /// Images whose `start_service` should fail (simulates a hard pull
    /// failure surfacing at start).
    pub fail_start_images: Mutex<HashSet<String>>,
    /// Canned exec responses keyed by argv[0]; everything else exits 0.
    pub exec_responses: Mutex<HashMap<String, ExecOutput>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every start of `image` fail.
    pub fn fail_starts_of(&self, image: &str) {
        self.fail_start_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(image.to_string());
    }

    /// Queues a canned response for execs whose argv[0] matches.
    pub fn respond_to_exec(&self, argv0: &str, exit_code: i32, output: &str) {
        self.exec_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                argv0.to_string(),
                ExecOutput {
                    exit_code,
                    output: output.to_string(),
                },
            );
    }

    /// Every shell command a service's sidecar has run, in order.
    pub fn sidecar_commands(&self, guid: &ServiceGuid) -> Vec<String> {
        self.lock().sidecars.get(guid).cloned().unwrap_or_default()
    }

    /// Every argv exec'd in a service, in order.
    pub fn exec_log(&self) -> Vec<(ServiceGuid, Vec<String>)> {
        self.lock().exec_log.clone()
    }

    /// Every artifact uuid expanded into a volume.
    pub fn expanded_artifacts(&self) -> Vec<String> {
        self.lock().expanded.clone()
    }

    /// Every image pulled.
    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled_images.clone()
    }

    /// The config the backend saw for a guid.
    pub fn config_of(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Option<ServiceConfig> {
        self.lock()
            .services
            .get(enclave_id)
            .and_then(|services| services.get(guid))
            .and_then(|record| record.config.clone())
    }
}

#[async_trait]
impl ContainerBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn create_network(
        &self,
        enclave_id: &EnclaveId,
        subnet: &Subnet,
        partitioning_enabled: bool,
    ) -> Result<NetworkHandle> {
        let mut state = self.lock();
        state.networks.insert(
            enclave_id.clone(),
            NetworkRecord {
                subnet: subnet.clone(),
                partitioning_enabled,
            },
        );
        state.services.entry(enclave_id.clone()).or_default();
        Ok(NetworkHandle {
            enclave_id: enclave_id.clone(),
            backend_id: format!("net-{enclave_id}"),
            subnet: subnet.clone(),
            partitioning_enabled,
        })
    }

    async fn destroy_network(&self, enclave_id: &EnclaveId) -> Result<()> {
        let mut state = self.lock();
        if state.networks.remove(enclave_id).is_none() {
            return Err(Error::BackendObjectNotFound {
                resource: "network",
                identifier: enclave_id.to_string(),
            });
        }
        state.services.remove(enclave_id);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkHandle>> {
        let state = self.lock();
        Ok(state
            .networks
            .iter()
            .map(|(enclave_id, record)| NetworkHandle {
                enclave_id: enclave_id.clone(),
                backend_id: format!("net-{enclave_id}"),
                subnet: record.subnet.clone(),
                partitioning_enabled: record.partitioning_enabled,
            })
            .collect())
    }

    async fn register_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
    ) -> Result<()> {
        let mut state = self.lock();
        let services = state.services.entry(enclave_id.clone()).or_default();
        if services.contains_key(&registration.guid) {
            return Err(Error::ServiceAlreadyRegistered(
                registration.guid.to_string(),
            ));
        }
        services.insert(
            registration.guid.clone(),
            ServiceRecord {
                registration: registration.clone(),
                status: ServiceStatus::Registered,
                config: None,
            },
        );
        Ok(())
    }

    async fn start_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<StartedService> {
        {
            let failing = self
                .fail_start_images
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if failing.contains(&config.image) {
                return Err(Error::StartFailed {
                    id: registration.id.to_string(),
                    reason: format!("image '{}' could not be fetched", config.image),
                });
            }
        }

        let mut state = self.lock();
        let record = state
            .services
            .get_mut(enclave_id)
            .and_then(|services| services.get_mut(&registration.guid))
            .ok_or_else(|| Error::ServiceNotFound(registration.guid.to_string()))?;
        match record.status {
            ServiceStatus::Registered => {}
            ServiceStatus::Running => {
                return Ok(StartedService {
                    maybe_public_ip: None,
                    public_ports: BTreeMap::new(),
                })
            }
            other => {
                return Err(Error::InvalidServiceState {
                    guid: registration.guid.to_string(),
                    state: other.to_string(),
                    expected: ServiceStatus::Registered.to_string(),
                })
            }
        }
        record.status = ServiceStatus::Running;
        record.config = Some(config.clone());

        // Publication policy: everything lands on localhost with the
        // private port number offset by one, so tests can tell the maps
        // apart.
        let mut public_ports = BTreeMap::new();
        for (port_id, private) in &config.private_ports {
            public_ports.insert(
                port_id.clone(),
                enclaverun::port_spec::PortSpec::new(
                    private.number.saturating_add(1),
                    private.transport,
                    private.maybe_application_protocol.clone(),
                )?,
            );
        }
        Ok(StartedService {
            maybe_public_ip: if public_ports.is_empty() {
                None
            } else {
                Some(Ipv4Addr::LOCALHOST)
            },
            public_ports,
        })
    }

    async fn stop_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        _stop_timeout: Duration,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut state = self.lock();
        let mut result = BulkResult::new();
        if let Some(services) = state.services.get_mut(enclave_id) {
            for record in services.values_mut() {
                if filters.matches(&record.registration, record.status) {
                    if record.status == ServiceStatus::Running {
                        record.status = ServiceStatus::Stopped;
                    }
                    result.successes.insert(record.registration.guid.clone());
                }
            }
        }
        Ok(result)
    }

    async fn destroy_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut state = self.lock();
        let mut result = BulkResult::new();
        if let Some(services) = state.services.get_mut(enclave_id) {
            let matching: Vec<ServiceGuid> = services
                .values()
                .filter(|r| filters.matches(&r.registration, r.status))
                .map(|r| r.registration.guid.clone())
                .collect();
            for guid in matching {
                services.remove(&guid);
                result.successes.insert(guid);
            }
        }
        Ok(result)
    }

    async fn list_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<Vec<BackendService>> {
        let state = self.lock();
        Ok(state
            .services
            .get(enclave_id)
            .map(|services| {
                services
                    .values()
                    .filter(|r| filters.matches(&r.registration, r.status))
                    .map(|r| BackendService {
                        registration: r.registration.clone(),
                        status: r.status,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pause_service(&self, _enclave_id: &EnclaveId, _guid: &ServiceGuid) -> Result<()> {
        Ok(())
    }

    async fn unpause_service(&self, _enclave_id: &EnclaveId, _guid: &ServiceGuid) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let canned = {
            let responses = self
                .exec_responses
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            argv.first().and_then(|argv0| responses.get(argv0).cloned())
        };
        self.lock().exec_log.push((guid.clone(), argv.to_vec()));
        Ok(canned.unwrap_or(ExecOutput {
            exit_code: 0,
            output: String::new(),
        }))
    }

    async fn copy_from_service(
        &self,
        _enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        path: &str,
    ) -> Result<Vec<u8>> {
        // A minimal tar containing one file named after the request.
        let mut builder = tar::Builder::new(Vec::new());
        let content = format!("copied from {guid}");
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                path.trim_start_matches('/'),
                content.as_bytes(),
            )
            .map_err(|e| Error::Internal(e.to_string()))?;
        builder.into_inner().map_err(|e| Error::Internal(e.to_string()))
    }

    async fn get_service_logs(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BTreeMap<ServiceGuid, Vec<String>>> {
        let state = self.lock();
        Ok(state
            .services
            .get(enclave_id)
            .map(|services| {
                services
                    .values()
                    .filter(|r| filters.matches(&r.registration, r.status))
                    .map(|r| {
                        (
                            r.registration.guid.clone(),
                            vec![format!("log line from {}", r.registration.id)],
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_artifact_volume(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuid: &str,
    ) -> Result<VolumeHandle> {
        let mut state = self.lock();
        state
            .volumes
            .entry(enclave_id.clone())
            .or_default()
            .insert(artifact_uuid.to_string());
        Ok(VolumeHandle {
            name: format!("vol-{artifact_uuid}"),
            artifact_uuid: artifact_uuid.to_string(),
        })
    }

    async fn expand_artifact_into_volume(
        &self,
        _enclave_id: &EnclaveId,
        _artifact_tgz: &Path,
        volume: &VolumeHandle,
    ) -> Result<()> {
        self.lock().expanded.push(volume.artifact_uuid.clone());
        Ok(())
    }

    async fn destroy_artifact_volumes(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuids: &BTreeSet<String>,
    ) -> Result<BulkResult<String>> {
        let mut state = self.lock();
        let mut result = BulkResult::new();
        let volumes = state.volumes.entry(enclave_id.clone()).or_default();
        for uuid in artifact_uuids {
            if volumes.remove(uuid) {
                result.successes.insert(uuid.clone());
            } else {
                result.failures.insert(
                    uuid.clone(),
                    Error::BackendObjectNotFound {
                        resource: "volume",
                        identifier: uuid.clone(),
                    },
                );
            }
        }
        Ok(result)
    }

    async fn create_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> Result<SidecarHandle> {
        self.lock()
            .sidecars
            .entry(service_guid.clone())
            .or_default();
        Ok(SidecarHandle {
            service_guid: service_guid.clone(),
            backend_id: format!("sidecar-{service_guid}"),
        })
    }

    async fn exec_in_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
        shell_command: &str,
    ) -> Result<ExecOutput> {
        let mut state = self.lock();
        state
            .sidecars
            .entry(sidecar.service_guid.clone())
            .or_default()
            .push(shell_command.to_string());
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn destroy_sidecars(
        &self,
        _enclave_id: &EnclaveId,
        service_guids: &BTreeSet<ServiceGuid>,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut state = self.lock();
        let mut result = BulkResult::new();
        for guid in service_guids {
            state.sidecars.remove(guid);
            result.successes.insert(guid.clone());
        }
        Ok(result)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.lock().pulled_images.push(image.to_string());
        Ok(())
    }
}
