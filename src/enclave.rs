//! Enclaves and their manager.
//!
//! An enclave is a uniquely-identified namespace: its own private subnet on
//! the backend, a data directory for artifacts and per-service scratch, and
//! the services/sidecars living inside it. The [`EnclaveManager`] creates
//! and destroys enclaves and owns one [`ServiceNetwork`] and one
//! [`FilesArtifactStore`] per enclave.

use crate::artifacts::FilesArtifactStore;
use crate::backend::{demote_not_found, ContainerBackend};
use crate::constants::{MODULES_DIRNAME, SERVICES_DIRNAME};
use crate::error::{Error, Result};
use crate::network::{ServiceNetwork, Subnet};
use crate::service::{ServiceConfig, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Enclave ID
// =============================================================================

/// Unique name of an enclave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnclaveId(String);

impl EnclaveId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnclaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EnclaveId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Enclave Status
// =============================================================================

/// Aggregate state of an enclave, derived from its services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclaveStatus {
    /// No services registered.
    Empty,
    /// At least one service is running.
    Running,
    /// Services exist but none is running.
    Stopped,
}

impl fmt::Display for EnclaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnclaveStatus::Empty => write!(f, "empty"),
            EnclaveStatus::Running => write!(f, "running"),
            EnclaveStatus::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Enclave
// =============================================================================

/// Descriptor of one enclave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enclave {
    pub id: EnclaveId,
    pub subnet: Subnet,
    pub data_dir: PathBuf,
    pub partitioning_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Everything the runtime holds for one live enclave.
pub struct EnclaveHandle {
    pub enclave: Enclave,
    pub network: Arc<ServiceNetwork>,
    pub artifacts: Arc<FilesArtifactStore>,
    backend: Arc<dyn ContainerBackend>,
}

impl std::fmt::Debug for EnclaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveHandle")
            .field("enclave", &self.enclave)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl EnclaveHandle {
    /// Derives the enclave's status from its services.
    pub async fn status(&self) -> EnclaveStatus {
        let services = self.network.services().await;
        if services.is_empty() {
            return EnclaveStatus::Empty;
        }
        if services
            .iter()
            .any(|s| s.status == ServiceStatus::Running)
        {
            EnclaveStatus::Running
        } else {
            EnclaveStatus::Stopped
        }
    }

    /// Best-effort pre-pull of the images a validated plan needs. Pull
    /// failures are transient: execution continues with whatever the
    /// backend has cached.
    pub async fn pull_images(&self, images: &BTreeSet<String>) {
        for image in images {
            if let Err(e) = self.backend.pull_image(image).await {
                warn!(%image, error = %e, "image pull failed, continuing with cached image");
            }
        }
    }

    /// Makes sure every files-artifact mount in a service config has a
    /// ready-to-mount volume: creates the volume and expands the stored
    /// tarball into it via the backend's expander.
    pub async fn prepare_artifact_mounts(&self, config: &ServiceConfig) -> Result<()> {
        for artifact_uuid in config.files_artifact_mounts.keys() {
            let tgz_path = self.artifacts.path_of(artifact_uuid)?;
            let volume = self
                .backend
                .create_artifact_volume(&self.enclave.id, artifact_uuid)
                .await?;
            self.backend
                .expand_artifact_into_volume(&self.enclave.id, &tgz_path, &volume)
                .await?;
            debug!(uuid = %artifact_uuid, volume = %volume.name, "expanded artifact volume");
        }
        Ok(())
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Filter over enclaves. Fields are ANDed; empty fields match all.
#[derive(Debug, Clone, Default)]
pub struct EnclaveFilters {
    pub ids: BTreeSet<EnclaveId>,
    pub statuses: BTreeSet<EnclaveStatus>,
}

impl EnclaveFilters {
    #[must_use]
    pub fn matches(&self, id: &EnclaveId, status: EnclaveStatus) -> bool {
        (self.ids.is_empty() || self.ids.contains(id))
            && (self.statuses.is_empty() || self.statuses.contains(&status))
    }
}

/// One row of a `GetEnclaves` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveInfo {
    pub id: EnclaveId,
    pub status: EnclaveStatus,
    pub subnet: Subnet,
    pub partitioning_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Enclave Manager
// =============================================================================

/// Base of the per-enclave subnet space: enclave `n` gets `10.96.n.0/24`.
const SUBNET_BASE: [u8; 2] = [10, 96];

/// Creates and destroys enclaves.
pub struct EnclaveManager {
    backend: Arc<dyn ContainerBackend>,
    base_data_dir: PathBuf,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    enclaves: HashMap<EnclaveId, Arc<EnclaveHandle>>,
    /// Third octet of the next subnet to hand out.
    next_subnet_octet: u16,
}

impl EnclaveManager {
    #[must_use]
    pub fn new(backend: Arc<dyn ContainerBackend>, base_data_dir: PathBuf) -> Self {
        Self {
            backend,
            base_data_dir,
            state: Mutex::new(ManagerState {
                enclaves: HashMap::new(),
                next_subnet_octet: 0,
            }),
        }
    }

    /// Creates an enclave: backend network, data directory, service network
    /// and artifact store.
    pub async fn create_enclave(
        &self,
        enclave_id: &EnclaveId,
        partitioning_enabled: bool,
    ) -> Result<Arc<EnclaveHandle>> {
        let mut state = self.state.lock().await;
        if state.enclaves.contains_key(enclave_id) {
            return Err(Error::EnclaveAlreadyExists(enclave_id.to_string()));
        }
        if state.next_subnet_octet > 255 {
            return Err(Error::EnclaveCreateFailed {
                id: enclave_id.to_string(),
                reason: "subnet space exhausted".to_string(),
            });
        }
        let subnet = Subnet::new(
            Ipv4Addr::new(
                SUBNET_BASE[0],
                SUBNET_BASE[1],
                state.next_subnet_octet as u8,
                0,
            ),
            24,
        )?;

        self.backend
            .create_network(enclave_id, &subnet, partitioning_enabled)
            .await
            .map_err(|e| Error::EnclaveCreateFailed {
                id: enclave_id.to_string(),
                reason: e.to_string(),
            })?;

        let data_dir = self.base_data_dir.join(enclave_id.as_str());
        let dir_result: Result<()> = (|| {
            std::fs::create_dir_all(data_dir.join(SERVICES_DIRNAME))?;
            std::fs::create_dir_all(data_dir.join(MODULES_DIRNAME))?;
            Ok(())
        })();
        let artifacts = match dir_result.and_then(|()| FilesArtifactStore::new(&data_dir)) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                // Unwind the network; a half-made enclave helps no one.
                if let Err(destroy_err) = self.backend.destroy_network(enclave_id).await {
                    warn!(%enclave_id, error = %destroy_err, "failed to unwind network after enclave create failure");
                }
                return Err(Error::EnclaveCreateFailed {
                    id: enclave_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let network = Arc::new(ServiceNetwork::new(
            enclave_id.clone(),
            subnet.clone(),
            partitioning_enabled,
            HashSet::new(),
            Arc::clone(&self.backend),
        ));

        let handle = Arc::new(EnclaveHandle {
            enclave: Enclave {
                id: enclave_id.clone(),
                subnet,
                data_dir,
                partitioning_enabled,
                created_at: chrono::Utc::now(),
            },
            network,
            artifacts,
            backend: Arc::clone(&self.backend),
        });
        state.next_subnet_octet += 1;
        state
            .enclaves
            .insert(enclave_id.clone(), Arc::clone(&handle));
        info!(%enclave_id, subnet = %handle.enclave.subnet, partitioning_enabled, "created enclave");
        Ok(handle)
    }

    /// Destroys an enclave and everything in it. Destroying a missing
    /// enclave is a no-op.
    pub async fn destroy_enclave(
        &self,
        enclave_id: &EnclaveId,
        stop_timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(handle) = state.enclaves.remove(enclave_id) else {
            debug!(%enclave_id, "destroy of missing enclave is a no-op");
            return Ok(());
        };

        let teardown = handle.network.destroy_all_services(stop_timeout).await?;
        for (guid, e) in teardown.failures {
            warn!(%guid, error = %e, "service teardown failed during enclave destroy");
        }

        // Artifact volume cleanup is lazy/best-effort: failures never mask
        // the destroy.
        match handle.artifacts.list() {
            Ok(uuids) => {
                let uuids: BTreeSet<String> = uuids.into_iter().collect();
                if !uuids.is_empty() {
                    match self
                        .backend
                        .destroy_artifact_volumes(enclave_id, &uuids)
                        .await
                    {
                        Ok(result) => {
                            let result = demote_not_found(result);
                            for (uuid, e) in result.failures {
                                warn!(%uuid, error = %e, "failed to destroy artifact volume");
                            }
                        }
                        Err(e) => warn!(error = %e, "artifact volume cleanup request failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list artifacts for cleanup"),
        }

        match self.backend.destroy_network(enclave_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = std::fs::remove_dir_all(&handle.enclave.data_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %handle.enclave.data_dir.display(), error = %e, "failed to remove enclave data dir");
            }
        }
        info!(%enclave_id, "destroyed enclave");
        Ok(())
    }

    /// Fetches a live enclave handle.
    pub async fn get_enclave(&self, enclave_id: &EnclaveId) -> Result<Arc<EnclaveHandle>> {
        let state = self.state.lock().await;
        state
            .enclaves
            .get(enclave_id)
            .cloned()
            .ok_or_else(|| Error::EnclaveNotFound(enclave_id.to_string()))
    }

    /// Lists enclaves matching the filter.
    pub async fn get_enclaves(&self, filters: &EnclaveFilters) -> Vec<EnclaveInfo> {
        let handles: Vec<Arc<EnclaveHandle>> = {
            let state = self.state.lock().await;
            state.enclaves.values().cloned().collect()
        };
        let mut infos = Vec::new();
        for handle in handles {
            let status = handle.status().await;
            if filters.matches(&handle.enclave.id, status) {
                infos.push(EnclaveInfo {
                    id: handle.enclave.id.clone(),
                    status,
                    subnet: handle.enclave.subnet.clone(),
                    partitioning_enabled: handle.enclave.partitioning_enabled,
                    created_at: handle.enclave.created_at,
                });
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
