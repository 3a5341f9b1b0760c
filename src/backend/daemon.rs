//! Daemon backend: drives a docker-compatible container daemon CLI.
//!
//! The daemon cannot represent a registration without a container, so the
//! REGISTERED and STOPPED states live in in-process records keyed off the
//! enclave network object; only RUNNING has a daemon-side container. The
//! records emulate the tombstone semantics the cluster backend gets for
//! free.
//!
//! Every created object carries the stable labels from
//! [`crate::backend::labels`]; leftover objects are found back by label
//! filter during network teardown.

use super::labels::{
    artifact_volume_labels, network_labels, service_labels, sidecar_labels, to_cli_args,
};
use super::{
    BackendService, BulkResult, ContainerBackend, ExecOutput, NetworkHandle, ServiceFilters,
    SidecarHandle, StartedService, VolumeHandle,
};
use crate::constants::{
    ENCLAVE_ID_LABEL_KEY, EXEC_TIMEOUT, IMAGE_PULL_TIMEOUT, MAX_EXEC_OUTPUT_BYTES,
};
use crate::enclave::EnclaveId;
use crate::error::{Error, Result};
use crate::network::Subnet;
use crate::port_spec::PortSpec;
use crate::service::{ServiceConfig, ServiceGuid, ServiceRegistration, ServiceStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Image used for the traffic-shaping sidecar (ships iptables).
const SIDECAR_IMAGE: &str = "enclaverun/networking-sidecar:1.2";

/// Image used to expand artifact tarballs into volumes.
const EXPANDER_IMAGE: &str = "busybox:1.36";

/// Mount point of the target volume inside the expander container.
const EXPANDER_DEST_DIR: &str = "/expansion";

/// Mount point of the artifact directory inside the expander container.
const EXPANDER_SRC_DIR: &str = "/artifact";

/// One service as the daemon backend tracks it between calls.
#[derive(Debug, Clone)]
struct ServiceRecord {
    registration: ServiceRegistration,
    status: ServiceStatus,
    /// Set once the service has been started at least once.
    started: Option<StartedService>,
}

/// Container backend over a docker-compatible CLI.
pub struct DaemonBackend {
    /// CLI binary ("docker" unless overridden for tests/podman).
    cli: String,
    /// Per-enclave registration records. The daemon itself only knows about
    /// RUNNING containers; this map is what turns stop into a tombstone.
    records: RwLock<HashMap<EnclaveId, HashMap<ServiceGuid, ServiceRecord>>>,
}

impl DaemonBackend {
    /// Creates a backend driving the `docker` binary.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cli("docker")
    }

    /// Creates a backend driving a custom docker-compatible binary.
    #[must_use]
    pub fn with_cli(cli: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn network_name(enclave_id: &EnclaveId) -> String {
        format!("enclaverun-net-{enclave_id}")
    }

    fn volume_name(enclave_id: &EnclaveId, artifact_uuid: &str) -> String {
        format!("{enclave_id}__artifact__{artifact_uuid}")
    }

    fn sidecar_name(service_guid: &ServiceGuid) -> String {
        format!("sidecar-{service_guid}")
    }

    /// Runs the CLI, failing if it could not be spawned at all.
    async fn run_cli(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(cli = %self.cli, ?args, "running daemon CLI");
        Command::new(&self.cli)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::BackendRequestFailed(format!("{} {}: {e}", self.cli, args.join(" "))))
    }

    /// Runs the CLI and maps a non-zero exit to an error, classifying
    /// missing-object failures as not-found.
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
        if is_not_found_stderr(&stderr) {
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

    fn record_for(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
    ) -> Result<ServiceRecord> {
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

    /// Matching records in this enclave, snapshotted under the lock.
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

    /// Asks the daemon which host port a published container port landed on.
    async fn published_port(
        &self,
        container: &str,
        port_id: &str,
        private: &PortSpec,
    ) -> Result<PortSpec> {
        let args = string_args(["port", container, &format!("{}/{}", private.number, private.transport)]);
        let output = self.run_cli_checked(&args, "container", container).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().next().ok_or_else(|| Error::StartFailed {
            id: container.to_string(),
            reason: format!("daemon reported no public binding for port '{port_id}'"),
        })?;
        // Lines look like "0.0.0.0:49153" or ":::49153".
        let host_port = line
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| Error::StartFailed {
                id: container.to_string(),
                reason: format!("unparseable public binding '{line}' for port '{port_id}'"),
            })?;
        PortSpec::new(
            host_port,
            private.transport,
            private.maybe_application_protocol.clone(),
        )
    }
}

impl Default for DaemonBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for DaemonBackend {
    fn name(&self) -> &'static str {
        "daemon"
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
        let name = Self::network_name(enclave_id);
        let mut args = string_args([
            "network",
            "create",
            "--driver",
            "bridge",
            "--subnet",
            &subnet.to_string(),
        ]);
        args.extend(to_cli_args(&network_labels(enclave_id, partitioning_enabled)));
        args.push(name.clone());

        let output = self.run_cli_checked(&args, "network", &name).await?;
        let backend_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(%enclave_id, subnet = %subnet, "created enclave network");

        self.records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?
            .entry(enclave_id.clone())
            .or_default();

        Ok(NetworkHandle {
            enclave_id: enclave_id.clone(),
            backend_id,
            subnet: subnet.clone(),
            partitioning_enabled,
        })
    }

    async fn destroy_network(&self, enclave_id: &EnclaveId) -> Result<()> {
        let name = Self::network_name(enclave_id);

        // The daemon refuses to remove a network with attached containers,
        // so find leftovers by label and force-remove them first.
        let filter = format!("label={ENCLAVE_ID_LABEL_KEY}={enclave_id}");
        let ps_args = string_args(["ps", "-aq", "--filter", &filter]);
        let output = self.run_cli(&ps_args).await?;
        for container_id in String::from_utf8_lossy(&output.stdout).lines() {
            let rm_args = string_args(["rm", "-f", container_id]);
            if let Err(e) = self.run_cli_checked(&rm_args, "container", container_id).await {
                warn!(%container_id, error = %e, "failed to remove leftover container");
            }
        }

        let args = string_args(["network", "rm", &name]);
        self.run_cli_checked(&args, "network", &name).await?;

        self.records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?
            .remove(enclave_id);
        info!(%enclave_id, "destroyed enclave network");
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkHandle>> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        // Networks are tracked via the record map; subnet and flags are not
        // re-read from the daemon here because callers that need them hold
        // the enclave handle already.
        Ok(records
            .keys()
            .map(|enclave_id| NetworkHandle {
                enclave_id: enclave_id.clone(),
                backend_id: Self::network_name(enclave_id),
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
        let mut records = self
            .records
            .write()
            .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
        let enclave = records.entry(enclave_id.clone()).or_default();
        if enclave.contains_key(&registration.guid) {
            return Err(Error::ServiceAlreadyRegistered(
                registration.guid.to_string(),
            ));
        }
        enclave.insert(
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
            // Idempotent with respect to already-desired state.
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

        let container = registration.guid.to_string();
        let mut args = string_args([
            "run",
            "-d",
            "--name",
            &container,
            "--network",
            &Self::network_name(enclave_id),
            "--ip",
            &registration.private_ip.to_string(),
        ]);
        args.extend(to_cli_args(&service_labels(
            enclave_id,
            registration,
            &config.private_ports,
        )));

        for (key, value) in &config.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if config.cpu_allocation_millicpus > 0 {
            args.push("--cpus".to_string());
            args.push(format!("{:.3}", config.cpu_allocation_millicpus as f64 / 1000.0));
        }
        if config.memory_allocation_megabytes > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}m", config.memory_allocation_megabytes));
        }
        for (artifact_uuid, mountpoint) in &config.files_artifact_mounts {
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{mountpoint}",
                Self::volume_name(enclave_id, artifact_uuid)
            ));
        }
        for (port_id, private) in &config.private_ports {
            // Static public ports are a daemon-only hint; everything else
            // gets an ephemeral host binding.
            match config.maybe_static_public_ports.get(port_id) {
                Some(public) => {
                    args.push("-p".to_string());
                    args.push(format!(
                        "{}:{}/{}",
                        public.number, private.number, private.transport
                    ));
                }
                None => {
                    args.push("-p".to_string());
                    args.push(format!("{}/{}", private.number, private.transport));
                }
            }
        }
        if let Some(entrypoint) = &config.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.join(" "));
        }
        args.push(config.image.clone());
        if let Some(cmd) = &config.cmd {
            args.extend(cmd.iter().cloned());
        }

        if let Err(e) = self.run_cli_checked(&args, "container", &container).await {
            // A half-created container must not linger as an orphan.
            let rm_args = string_args(["rm", "-f", &container]);
            if let Err(cleanup_err) = self.run_cli(&rm_args).await {
                warn!(%container, error = %cleanup_err, "failed to remove container after start failure");
            }
            return Err(Error::StartFailed {
                id: registration.id.to_string(),
                reason: e.to_string(),
            });
        }

        let mut public_ports = BTreeMap::new();
        for (port_id, private) in &config.private_ports {
            let public = self.published_port(&container, port_id, private).await?;
            public_ports.insert(port_id.clone(), public);
        }
        let started = StartedService {
            maybe_public_ip: if public_ports.is_empty() {
                None
            } else {
                Some(Ipv4Addr::LOCALHOST)
            },
            public_ports,
        };

        let started_clone = started.clone();
        self.update_record(enclave_id, &registration.guid, move |record| {
            record.status = ServiceStatus::Running;
            record.started = Some(started_clone);
        })?;
        info!(guid = %registration.guid, image = %config.image, "started service container");
        Ok(started)
    }

    async fn stop_services(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
        stop_timeout: Duration,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut result = BulkResult::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();
            if record.status != ServiceStatus::Running {
                // Already in (or past) the desired state.
                result.successes.insert(guid);
                continue;
            }
            let container = guid.to_string();
            let stop_args = string_args([
                "stop",
                "-t",
                &stop_timeout.as_secs().to_string(),
                &container,
            ]);
            let stopped = self.run_cli_checked(&stop_args, "container", &container).await;
            let rm_args = string_args(["rm", "-f", &container]);
            let removed = self.run_cli_checked(&rm_args, "container", &container).await;

            match stopped.and(removed) {
                // Tombstone: the registration record stays behind.
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
        let mut result = BulkResult::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();
            if record.status == ServiceStatus::Running || record.status == ServiceStatus::Stopped {
                let container = guid.to_string();
                let args = string_args(["rm", "-f", &container]);
                match self.run_cli_checked(&args, "container", &container).await {
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
            let mut records = self
                .records
                .write()
                .map_err(|e| Error::Internal(format!("records lock poisoned: {e}")))?;
            if let Some(enclave) = records.get_mut(enclave_id) {
                enclave.remove(&guid);
            }
            result.successes.insert(guid);
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

    async fn pause_service(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Result<()> {
        let record = self.record_for(enclave_id, guid)?;
        if record.status != ServiceStatus::Running {
            return Err(Error::InvalidServiceState {
                guid: guid.to_string(),
                state: record.status.to_string(),
                expected: ServiceStatus::Running.to_string(),
            });
        }
        let container = guid.to_string();
        let args = string_args(["pause", &container]);
        self.run_cli_checked(&args, "container", &container).await?;
        Ok(())
    }

    async fn unpause_service(&self, enclave_id: &EnclaveId, guid: &ServiceGuid) -> Result<()> {
        let _ = self.record_for(enclave_id, guid)?;
        let container = guid.to_string();
        let args = string_args(["unpause", &container]);
        self.run_cli_checked(&args, "container", &container).await?;
        Ok(())
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
        let container = guid.to_string();
        let mut args = string_args(["exec", &container]);
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
        bounded_exec_output(guid, output)
    }

    async fn copy_from_service(
        &self,
        enclave_id: &EnclaveId,
        guid: &ServiceGuid,
        path: &str,
    ) -> Result<Vec<u8>> {
        let _ = self.record_for(enclave_id, guid)?;
        let container = guid.to_string();
        let args = string_args(["cp", &format!("{container}:{path}"), "-"]);
        let output = self.run_cli_checked(&args, "container", &container).await?;
        Ok(output.stdout)
    }

    async fn get_service_logs(
        &self,
        enclave_id: &EnclaveId,
        filters: &ServiceFilters,
    ) -> Result<BTreeMap<ServiceGuid, Vec<String>>> {
        let mut logs = BTreeMap::new();
        for record in self.matching_records(enclave_id, filters)? {
            let guid = record.registration.guid.clone();
            let container = guid.to_string();
            let args = string_args(["logs", &container]);
            match self.run_cli_checked(&args, "container", &container).await {
                Ok(output) => {
                    let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .map(str::to_string)
                        .collect();
                    lines.extend(
                        String::from_utf8_lossy(&output.stderr)
                            .lines()
                            .map(str::to_string),
                    );
                    logs.insert(guid, lines);
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
        let name = Self::volume_name(enclave_id, artifact_uuid);
        let mut args = string_args(["volume", "create"]);
        args.extend(to_cli_args(&artifact_volume_labels(enclave_id, artifact_uuid)));
        args.push(name.clone());
        self.run_cli_checked(&args, "volume", &name).await?;
        Ok(VolumeHandle {
            name,
            artifact_uuid: artifact_uuid.to_string(),
        })
    }

    async fn expand_artifact_into_volume(
        &self,
        _enclave_id: &EnclaveId,
        artifact_tgz: &Path,
        volume: &VolumeHandle,
    ) -> Result<()> {
        let artifact_dir = artifact_tgz.parent().ok_or_else(|| {
            Error::Internal(format!("artifact path '{}' has no parent", artifact_tgz.display()))
        })?;
        let artifact_file = artifact_tgz
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Internal(format!("artifact path '{}' has no file name", artifact_tgz.display()))
            })?;

        let args = string_args([
            "run",
            "--rm",
            "--volume",
            &format!("{}:{EXPANDER_DEST_DIR}", volume.name),
            "--volume",
            &format!("{}:{EXPANDER_SRC_DIR}:ro", artifact_dir.display()),
            EXPANDER_IMAGE,
            "tar",
            "-xzf",
            &format!("{EXPANDER_SRC_DIR}/{artifact_file}"),
            "-C",
            EXPANDER_DEST_DIR,
        ]);

        if let Err(e) = self.run_cli_checked(&args, "volume", &volume.name).await {
            // Partial expansions are never left behind.
            let rm_args = string_args(["volume", "rm", "-f", &volume.name]);
            if let Err(cleanup_err) = self.run_cli(&rm_args).await {
                warn!(volume = %volume.name, error = %cleanup_err, "failed to clean up partial volume");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn destroy_artifact_volumes(
        &self,
        enclave_id: &EnclaveId,
        artifact_uuids: &BTreeSet<String>,
    ) -> Result<BulkResult<String>> {
        let mut result = BulkResult::new();
        for uuid in artifact_uuids {
            let name = Self::volume_name(enclave_id, uuid);
            let args = string_args(["volume", "rm", "-f", &name]);
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
        enclave_id: &EnclaveId,
        service_guid: &ServiceGuid,
    ) -> Result<SidecarHandle> {
        let record = self.record_for(enclave_id, service_guid)?;
        if record.status != ServiceStatus::Running {
            return Err(Error::InvalidServiceState {
                guid: service_guid.to_string(),
                state: record.status.to_string(),
                expected: ServiceStatus::Running.to_string(),
            });
        }

        let name = Self::sidecar_name(service_guid);
        let mut args = string_args([
            "run",
            "-d",
            "--name",
            &name,
            // Shares the service's network namespace so its filter rules
            // apply to the service's traffic.
            "--network",
            &format!("container:{service_guid}"),
            "--cap-add",
            "NET_ADMIN",
        ]);
        args.extend(to_cli_args(&sidecar_labels(enclave_id, service_guid)));
        args.push(SIDECAR_IMAGE.to_string());
        args.extend(string_args(["sleep", "infinity"]));

        self.run_cli_checked(&args, "container", &name).await?;
        info!(service = %service_guid, "created networking sidecar");
        Ok(SidecarHandle {
            service_guid: service_guid.clone(),
            backend_id: name,
        })
    }

    async fn exec_in_sidecar(
        &self,
        _enclave_id: &EnclaveId,
        sidecar: &SidecarHandle,
        shell_command: &str,
    ) -> Result<ExecOutput> {
        let args = string_args(["exec", &sidecar.backend_id, "sh", "-c", shell_command]);
        let output = match tokio::time::timeout(EXEC_TIMEOUT, self.run_cli(&args)).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("exec in sidecar of '{}'", sidecar.service_guid),
                    duration: EXEC_TIMEOUT,
                })
            }
        };
        bounded_exec_output(&sidecar.service_guid, output)
    }

    async fn destroy_sidecars(
        &self,
        _enclave_id: &EnclaveId,
        service_guids: &BTreeSet<ServiceGuid>,
    ) -> Result<BulkResult<ServiceGuid>> {
        let mut result = BulkResult::new();
        for guid in service_guids {
            let name = Self::sidecar_name(guid);
            let args = string_args(["rm", "-f", &name]);
            match self.run_cli_checked(&args, "container", &name).await {
                Ok(_) => {
                    result.successes.insert(guid.clone());
                }
                Err(e) => {
                    result.failures.insert(guid.clone(), e);
                }
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Images
    // =========================================================================

    async fn pull_image(&self, image: &str) -> Result<()> {
        let args = string_args(["pull", image]);
        let pull = self.run_cli_checked(&args, "image", image);
        match tokio::time::timeout(IMAGE_PULL_TIMEOUT, pull).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::Timeout {
                operation: format!("pull image '{image}'"),
                duration: IMAGE_PULL_TIMEOUT,
            }),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn string_args<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn is_not_found_stderr(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("no such") || lowered.contains("not found")
}

/// Converts raw process output to an [`ExecOutput`], enforcing the
/// deterministic-log bound.
fn bounded_exec_output(guid: &ServiceGuid, output: std::process::Output) -> Result<ExecOutput> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(is_not_found_stderr("Error: No such container: foo"));
        assert!(is_not_found_stderr("Error response from daemon: network abc not found"));
        assert!(!is_not_found_stderr("Error: permission denied"));
    }

    #[test]
    fn test_object_names_are_deterministic() {
        let enclave = EnclaveId::new("e1");
        assert_eq!(DaemonBackend::network_name(&enclave), "enclaverun-net-e1");
        assert_eq!(
            DaemonBackend::volume_name(&enclave, "abcd"),
            "e1__artifact__abcd"
        );
        assert_eq!(
            DaemonBackend::sidecar_name(&ServiceGuid::from_string("db-1")),
            "sidecar-db-1"
        );
    }
}
