//! Cluster backend: drives a kubectl-compatible cluster scheduler CLI.
//!
//! Unlike the daemon, the scheduler can represent every lifecycle state as a
//! first-class object: a registration is a cluster Service pinning the
//! private IP, and RUNNING attaches a pod behind it. Deleting the pod but
//! keeping the Service is exactly the STOPPED tombstone.
//!
//! ```text
//!                  register (Service object)
//!          ∅ ─────────────▶ REGISTERED
//!                              │  start (Pod object)
//!                              ▼
//!                           RUNNING ──stop (delete Pod)──▶ STOPPED
//!                              │                               │
//!                              └──── destroy (delete both) ────┴──▶ ∅
//! ```
//!
//! Publication policy: the scheduler exposes nothing outside the cluster, so
//! `start_service` returns no public IP and an empty public port map. The
//! static-public-port hint is ignored here. Pause/unpause and sidecars are
//! refused with typed not-supported errors: the scheduler can neither freeze
//! a pod nor attach a container to a running pod's network namespace.

use super::labels::{network_labels, service_labels};
use super::{
    BackendService, BulkResult, ContainerBackend, ExecOutput, NetworkHandle, ServiceFilters,
    SidecarHandle, StartedService, VolumeHandle,
};
use crate::constants::{EXEC_TIMEOUT, MAX_EXEC_OUTPUT_BYTES};
use crate::enclave::EnclaveId;
use crate::error::{Error, Result};
use crate::network::Subnet;
use crate::service::{ServiceConfig, ServiceGuid, ServiceRegistration, ServiceStatus};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Image used to expand artifact tarballs into volumes.
const EXPANDER_IMAGE: &str = "busybox:1.36";

/// Mount point of the artifact volume inside the expander pod.
const EXPANDER_DEST_DIR: &str = "/expansion";

/// How long to wait for an expander pod to become ready.
const EXPANDER_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct ServiceRecord {
    registration: ServiceRegistration,
    status: ServiceStatus,
    started: Option<StartedService>,
}

/// Container backend over a kubectl-compatible CLI.
pub struct ClusterBackend {
    cli: String,
    records: RwLock<HashMap<EnclaveId, HashMap<ServiceGuid, ServiceRecord>>>,
}

impl ClusterBackend {
    /// Creates a backend driving the `kubectl` binary.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cli("kubectl")
    }

    /// Creates a backend driving a custom kubectl-compatible binary.
    #[must_use]
    pub fn with_cli(cli: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn namespace(enclave_id: &EnclaveId) -> String {
        format!("enclaverun-{enclave_id}")
    }

    fn pod_name(guid: &ServiceGuid) -> String {
        format!("svc-{guid}")
    }

    fn registration_name(guid: &ServiceGuid) -> String {
        format!("reg-{guid}")
    }

    fn pvc_name(artifact_uuid: &str) -> String {
        format!("artifact-{artifact_uuid}")
    }

    async fn run_cli(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(cli = %self.cli, ?args, "running scheduler CLI");
        Command::new(&self.cli)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::BackendRequestFailed(format!("{} {}: {e}", self.cli, args.join(" "))))
    }

    async fn run_cli_checked(
        &self,
        args: &[String],
        resource: &'static str,
        identifier: &str,
    ) -> Result<std::process::Output> {
        let output = self.run_cli(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.to_ascii_lowercase().contains("not found") {
            return Err(Error::BackendObjectNotFound {
                resource,
                identifier: identifier.to_string(),
            });
        }
        Err(Error::BackendRequestFailed(format!(
            "{} {} exited with {}: {}",
            self.cli,
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }

    /// Applies a JSON manifest via the CLI's stdin.
    async fn apply_manifest(&self, manifest: &serde_json::Value) -> Result<()> {
        let mut child = Command::new(&self.cli)
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BackendRequestFailed(format!("{} apply: {e}", self.cli)))?;

        let body = serde_json::to_vec(manifest)?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| Error::BackendRequestFailed(format!("writing manifest: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::BackendRequestFailed(format!("{} apply: {e}", self.cli)))?;
        if !output.status.success() {
            return Err(Error::BackendRequestFailed(format!(
                "{} apply exited with {}: {}",
                self.cli,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn record_for(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Result<ServiceRecord> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        records
            .get(enclave_id)
            .and_then(|enclave| enclave.get(guid))
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(guid.to_string()))
    }

    fn update_record(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        update: impl FnOnce(&mut ServiceRecord),
    ) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        let record = records
            .get_mut(enclave_id)
            .and_then(|enclave| enclave.get_mut(guid))
            .ok_or_else(|| Error::ServiceNotFound(guid.to_string()))?;
        update(record);
        Ok(())
    }

    fn matching_records(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<Vec<ServiceRecord>> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        Ok(records
            .get(enclave_id)
            .map(|enclave| {
                enclave
                    .values()
                    .filter(|r| filters.matches(&r.registration, r.status))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl Default for ClusterBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    // =========================================================================
    // Network
    // =========================================================================

    async fn create_network(
        &self,
        enclave_id: &EnclaveId,
        subnet: &Subnet,
        partitioning_enabled: bool,
    ) -> Result<NetworkHandle> {
        let namespace = Self::namespace(enclave_id);
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": network_labels(enclave_id, partitioning_enabled),
            },
        });
        self.apply_manifest(&manifest).await?;
        info!(%enclave_id, %namespace, "created enclave namespace");

        self.records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?
            .entry(enclave_id.clone())
            .or_default();

        Ok(NetworkHandle {
            enclave_id: enclave_id.clone(),
            backend_id: namespace,
            subnet: subnet.clone(),
            partitioning_enabled,
        })
    }

    async fn destroy_network(&self, enclave_id: &EnclaveId) -> Result<()> {
        let namespace = Self::namespace(enclave_id);
        // Deleting the namespace cascades to every object inside it.
        let args = string_args(["delete", "namespace", &namespace, "--wait=true"]);
        self.run_cli_checked(&args, "namespace", &namespace).await?;
        self.records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?
            .remove(enclave_id);
        info!(%enclave_id, "destroyed enclave namespace");
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkHandle>> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        Ok(records
            .keys()
            .map(|enclave_id| NetworkHandle {
                enclave_id: enclave_id.clone(),
                backend_id: Self::namespace(enclave_id),
                subnet: Subnet::default(),
                partitioning_enabled: false,
            })
            .collect())
    }

    // =========================================================================
    // Service Lifecycle
    // =========================================================================

    async fn register_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
    ) -> Result<()> {
        {
            let records = self
                .records
                .read()
                .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
            if records
                .get(enclave_id)
                .is_some_and(|e| e.contains_key(&registration.guid))
            {
                return Err(Error::ServiceAlreadyRegistered(
                    registration.guid.to_string(),
                ));
            }
        }

        // The registration object is a Service pinning the private IP; it
        // selects the pod that start_service attaches later.
        let guid_label_key = crate::constants::GUID_LABEL_KEY;
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": Self::registration_name(&registration.guid),
                "namespace": Self::namespace(enclave_id),
                "labels": service_labels(enclave_id, registration, &BTreeMap::new()),
            },
            "spec": {
                "clusterIP": registration.private_ip.to_string(),
                "selector": {
                    guid_label_key: registration.guid.to_string(),
                },
                // Ports are patched on once the service starts; the
                // scheduler requires at least one entry up front.
                "ports": [{"name": "placeholder", "port": 1, "protocol": "TCP"}],
            },
        });
        self.apply_manifest(&manifest).await?;

        self.records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?
            .entry(enclave_id.clone())
            .or_default()
            .insert(
                registration.guid.clone(),
                ServiceRecord {
                    registration: registration.clone(),
                    status: ServiceStatus::Registered,
                    started: None,
                },
            );
        debug!(guid = %registration.guid, ip = %registration.private_ip, "registered service");
        Ok(())
    }

    async fn start_service(
        &self,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<StartedService> {
        let record = self.record_for(enclave_id, &registration.guid)?;
        match record.status {
            ServiceStatus::Registered => {}
            ServiceStatus::Running => {
                if let Some(started) = record.started {
                    return Ok(started);
                }
                return Err(Error::Internal(format!(
                    "running service '{}' has no start record",
                    registration.guid
                )));
            }
            other => {
                return Err(Error::InvalidServiceState {
                    guid: registration.guid.to_string(),
                    state: other.to_string(),
                    expected: ServiceStatus::Registered.to_string(),
                })
            }
        }

        let container_ports: Vec<serde_json::Value> = config
            .private_ports
            .iter()
            .map(|(port_id, spec)| {
                json!({
                    "name": port_id,
                    "containerPort": spec.number,
                    "protocol": spec.transport.to_string().to_uppercase(),
                })
            })
            .collect();
        let env: Vec<serde_json::Value> = config
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        let volume_mounts: Vec<serde_json::Value> = config
            .files_artifact_mounts
            .iter()
            .map(|(uuid, mountpoint)| {
                json!({"name": Self::pvc_name(uuid), "mountPath": mountpoint})
            })
            .collect();
        let volumes: Vec<serde_json::Value> = config
            .files_artifact_mounts
            .keys()
            .map(|uuid| {
                json!({
                    "name": Self::pvc_name(uuid),
                    "persistentVolumeClaim": {"claimName": Self::pvc_name(uuid)},
                })
            })
            .collect();

        let mut resources = serde_json::Map::new();
        if config.cpu_allocation_millicpus > 0 {
            resources.insert(
                "cpu".to_string(),
                json!(format!("{}m", config.cpu_allocation_millicpus)),
            );
        }
        if config.memory_allocation_megabytes > 0 {
            resources.insert(
                "memory".to_string(),
                json!(format!("{}Mi", config.memory_allocation_megabytes)),
            );
        }

        let mut container = serde_json::Map::new();
        container.insert("name".to_string(), json!("user-service"));
        container.insert("image".to_string(), json!(config.image));
        container.insert("ports".to_string(), json!(container_ports));
        container.insert("env".to_string(), json!(env));
        container.insert("volumeMounts".to_string(), json!(volume_mounts));
        if let Some(entrypoint) = &config.entrypoint {
            container.insert("command".to_string(), json!(entrypoint));
        }
        if let Some(cmd) = &config.cmd {
            container.insert("args".to_string(), json!(cmd));
        }
        if !resources.is_empty() {
            container.insert("resources".to_string(), json!({"limits": resources}));
        }

        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": Self::pod_name(&registration.guid),
                "namespace": Self::namespace(enclave_id),
                "labels": service_labels(enclave_id, registration, &config.private_ports),
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [serde_json::Value::Object(container)],
                "volumes": volumes,
            },
        });
        self.apply_manifest(&manifest).await.map_err(|e| Error::StartFailed {
            id: registration.id.to_string(),
            reason: e.to_string(),
        })?;

        // Nothing is published outside the cluster.
        let started = StartedService {
            maybe_public_ip: None,
            public_ports: BTreeMap::new(),
        };
        let started_clone = started.clone();
        self.update_record(enclave_id, &registration.guid, move |record| {
            record.status = ServiceStatus::Running;
            record.started = Some(started_clone);
        })?;
        info!(guid = %registration.guid, image = %config.image, "started service pod");
        Ok(started)
    }

    async fn stop_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        stop_timeout: Duration,
    ) -> Result<BulkResult<ServiceGuid>> {
        let namespace = Self::namespace(enclave_id);
        let mut result = BulkResult::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();
            if record.status != ServiceStatus::Running {
                result.successes.insert(guid);
                continue;
            }
            let pod = Self::pod_name(&guid);
            let args = string_args([
                "delete",
                "pod",
                "-n",
                &namespace,
                &pod,
                &format!("--grace-period={}", stop_timeout.as_secs()),
            ]);
            match self.run_cli_checked(&args, "pod", &pod).await {
                // The registration Service object stays: first-class STOPPED.
                Ok(_) | Err(Error::BackendObjectNotFound { .. }) => {
                    self.update_record(enclave_id, &guid, |r| {
                        r.status = ServiceStatus::Stopped;
                    })?;
                    result.successes.insert(guid);
                }
                Err(e) => {
                    result.failures.insert(
                        guid.clone(),
                        Error::StopFailed {
                            guid: guid.to_string(),
                            reason: e.to_string(),
                        },
                    );
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
        let namespace = Self::namespace(enclave_id);
        let mut result = BulkResult::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();

            if record.status == ServiceStatus::Running {
                let pod = Self::pod_name(&guid);
                let args = string_args(["delete", "pod", "-n", &namespace, &pod, "--now"]);
                match self.run_cli_checked(&args, "pod", &pod).await {
                    Ok(_) | Err(Error::BackendObjectNotFound { .. }) => {}
                    Err(e) => {
                        result.failures.insert(
                            guid.clone(),
                            Error::DestroyFailed {
                                guid: guid.to_string(),
                                reason: e.to_string(),
                            },
                        );
                        continue;
                    }
                }
            }

            let reg = Self::registration_name(&guid);
            let args = string_args(["delete", "service", "-n", &namespace, &reg]);
            match self.run_cli_checked(&args, "service", &reg).await {
                Ok(_) | Err(Error::BackendObjectNotFound { .. }) => {
                    let mut records = self
                        .records
                        .write()
                        .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
                    if let Some(enclave) = records.get_mut(enclave_id) {
                        enclave.remove(&guid);
                    }
                    result.successes.insert(guid);
                }
                Err(e) => {
                    result.failures.insert(
                        guid.clone(),
                        Error::DestroyFailed {
                            guid: guid.to_string(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
        Ok(result)
    }

    async fn list_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<Vec<BackendService>> {
        Ok(self
            .matching_records(enclave_id, filters)?
            .into_iter()
            .map(|r| BackendService {
                registration: r.registration,
                status: r.status,
            })
            .collect())
    }

    async fn pause_service(&self, _enclave_id: &EnclaveId, _guid: &ServiceGuid) -> Result<()> {
        Err(Error::NotSupported(
            "the cluster scheduler cannot pause a running pod".to_string(),
        ))
    }

    async fn unpause_service(&self, _enclave_id: &EnclaveId, _guid: &ServiceGuid) -> Result<()> {
        Err(Error::NotSupported(
            "the cluster scheduler cannot pause a running pod".to_string(),
        ))
    }

    // =========================================================================
    // Exec / Copy / Logs
    // =========================================================================

    async fn exec(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let _ = self.record_for(enclave_id, guid)?;
        let namespace = Self::namespace(enclave_id);
        let pod = Self::pod_name(guid);
        let mut args = string_args(["exec", "-n", &namespace, &pod, "--"]);
        args.extend(argv.iter().cloned());

        let output = match tokio::time::timeout(EXEC_TIMEOUT, self.run_cli(&args)).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("exec in service '{guid}'"),
                    duration: EXEC_TIMEOUT,
                })
            }
        };
        let total = output.stdout.len() + output.stderr.len();
        if total > MAX_EXEC_OUTPUT_BYTES {
            return Err(Error::ExecOutputTooLarge {
                service: guid.to_string(),
                limit: MAX_EXEC_OUTPUT_BYTES,
            });
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn copy_from_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        path: &str,
    ) -> Result<Vec<u8>> {
        let _ = self.record_for(enclave_id, guid)?;
        let namespace = Self::namespace(enclave_id);
        let pod = Self::pod_name(guid);
        let args = string_args(["exec", "-n", &namespace, &pod, "--", "tar", "cf", "-", path]);
        let output = self.run_cli_checked(&args, "pod", &pod).await?;
        Ok(output.stdout)
    }

    async fn get_service_logs(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BTreeMap<ServiceGuid, Vec<String>>> {
        let namespace = Self::namespace(enclave_id);
        let mut logs = BTreeMap::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();
            let pod = Self::pod_name(&guid);
            let args = string_args(["logs", "-n", &namespace, &pod]);
            match self.run_cli_checked(&args, "pod", &pod).await {
                Ok(output) => {
                    logs.insert(
                        guid,
                        String::from_utf8_lossy(&output.stdout)
                            .lines()
                            .map(str::to_string)
                            .collect(),
                    );
                }
                Err(Error::BackendObjectNotFound { .. }) => {
                    logs.insert(guid, Vec::new());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(logs)
    }

    // =========================================================================
    // Files-Artifact Volumes
    // =========================================================================

    async fn create_artifact_volume(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuid: &str,
    ) -> Result<VolumeHandle> {
        let name = Self::pvc_name(artifact_uuid);
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": name,
                "namespace": Self::namespace(enclave_id),
                "labels": super::labels::artifact_volume_labels(enclave_id, artifact_uuid),
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "1Gi"}},
            },
        });
        self.apply_manifest(&manifest).await?;
        Ok(VolumeHandle {
            name,
            artifact_uuid: artifact_uuid.to_string(),
        })
    }

    async fn expand_artifact_into_volume(
        &self,
        enclave_id: &EnclaveId,
        artifact_tgz: &Path,
        volume: &VolumeHandle,
    ) -> Result<()> {
        let namespace = Self::namespace(enclave_id);
        let expander = format!("expander-{}", volume.artifact_uuid);

        let resource_type_key = crate::constants::RESOURCE_TYPE_LABEL_KEY;
        let expand = async {
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": expander,
                    "namespace": namespace,
                    "labels": {
                        resource_type_key: crate::constants::RESOURCE_TYPE_EXPANDER,
                    },
                },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "expander",
                        "image": EXPANDER_IMAGE,
                        "command": ["sleep", "300"],
                        "volumeMounts": [{"name": "target", "mountPath": EXPANDER_DEST_DIR}],
                    }],
                    "volumes": [{
                        "name": "target",
                        "persistentVolumeClaim": {"claimName": volume.name},
                    }],
                },
            });
            self.apply_manifest(&manifest).await?;

            let wait_args = string_args([
                "wait",
                "-n",
                &namespace,
                "--for=condition=Ready",
                &format!("pod/{expander}"),
                &format!("--timeout={}s", EXPANDER_READY_TIMEOUT.as_secs()),
            ]);
            self.run_cli_checked(&wait_args, "pod", &expander).await?;

            let cp_args = string_args([
                "cp",
                &artifact_tgz.display().to_string(),
                &format!("{namespace}/{expander}:/tmp/artifact.tgz"),
            ]);
            self.run_cli_checked(&cp_args, "pod", &expander).await?;

            let tar_args = string_args([
                "exec",
                "-n",
                &namespace,
                &expander,
                "--",
                "tar",
                "-xzf",
                "/tmp/artifact.tgz",
                "-C",
                EXPANDER_DEST_DIR,
            ]);
            self.run_cli_checked(&tar_args, "pod", &expander).await?;
            Ok(())
        };
        let result: Result<()> = expand.await;

        // The expander pod is scratch either way.
        let del_args = string_args(["delete", "pod", "-n", &namespace, &expander, "--now"]);
        if let Err(e) = self.run_cli(&del_args).await {
            warn!(pod = %expander, error = %e, "failed to delete expander pod");
        }

        if result.is_err() {
            // Partial expansions are never left behind.
            let pvc_args = string_args(["delete", "pvc", "-n", &namespace, &volume.name]);
            if let Err(e) = self.run_cli(&pvc_args).await {
                warn!(volume = %volume.name, error = %e, "failed to clean up partial volume");
            }
        }
        result
    }

    async fn destroy_artifact_volumes(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuids: &BTreeSet<String>,
    ) -> Result<BulkResult<String>> {
        let namespace = Self::namespace(enclave_id);
        let mut result = BulkResult::new();
        for uuid in artifact_uuids {
            let name = Self::pvc_name(uuid);
            let args = string_args(["delete", "pvc", "-n", &namespace, &name]);
            match self.run_cli_checked(&args, "volume", &name).await {
                Ok(_) => {
                    result.successes.insert(uuid.clone());
                }
                Err(e) => {
                    result.failures.insert(uuid.clone(), e);
                }
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Sidecars
    // =========================================================================

    async fn create_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        _service_guid: &ServiceGuid,
    ) -> Result<SidecarHandle> {
        Err(Error::NotSupported(
            "the cluster scheduler cannot attach a sidecar to a running pod".to_string(),
        ))
    }

    async fn exec_in_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        _sidecar: &SidecarHandle,
        _shell_command: &str,
    ) -> Result<ExecOutput> {
        Err(Error::NotSupported(
            "the cluster scheduler does not support sidecars".to_string(),
        ))
    }

    async fn destroy_sidecars(
        &self,
        _enclave_id: &EnclaveId,
        service_guids: &BTreeSet<ServiceGuid>,
    ) -> Result<BulkResult<ServiceGuid>> {
        // No sidecar can exist on this backend: every destroy is already in
        // the desired state.
        let mut result = BulkResult::new();
        result.successes.extend(service_guids.iter().cloned());
        Ok(result)
    }

    // =========================================================================
    // Images
    // =========================================================================

    async fn pull_image(&self, image: &str) -> Result<()> {
        // Cluster nodes pull on pod creation; there is nothing useful to
        // pre-pull from here.
        debug!(%image, "cluster backend defers image pull to pod scheduling");
        Ok(())
    }
}

fn string_args<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names_are_deterministic() {
        let enclave = EnclaveId::new("e1");
        assert_eq!(ClusterBackend::namespace(&enclave), "enclaverun-e1");
        assert_eq!(
            ClusterBackend::pod_name(&ServiceGuid::from_string("db-1")),
            "svc-db-1"
        );
        assert_eq!(
            ClusterBackend::registration_name(&ServiceGuid::from_string("db-1")),
            "reg-db-1"
        );
        assert_eq!(ClusterBackend::pvc_name("abcd"), "artifact-abcd");
    }
}
