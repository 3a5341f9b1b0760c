//! The runtime's RPC server.
//!
//! A thin translation layer: frames come in over TCP (see [`protocol`]),
//! get dispatched to the enclave manager / service network / plan pipeline,
//! and results go back out as frames. Plan runs and log fetches stream
//! multiple frames; everything else is unary.

pub mod protocol;

use crate::constants::{DEFAULT_STOP_TIMEOUT, PROTOCOL_VERSION};
use crate::enclave::{EnclaveFilters, EnclaveHandle, EnclaveId, EnclaveManager};
use crate::error::{Error, Result};
use crate::network::{
    PartitionConnection, PartitionConnectionId, PartitionId, ProbeMethod,
};
use crate::plan::{
    ErrorKind, Interpreter, PlanExecutor, PlanValidator, ResponseLine, ValidatorEnvironment,
};
use crate::plan::{ContentProvider, InMemoryContentProvider, DEFAULT_SCRIPT_FILENAME};
use crate::backend::ServiceFilters;
use crate::service::{Service, ServiceConfig, ServiceId};
use flate2::read::GzDecoder;
use protocol::{
    handshake_response, read_frame, write_frame, PackageContent, Request, Response,
    ServiceSummary,
};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// The runtime's API server.
pub struct ApiServer {
    manager: Arc<EnclaveManager>,
}

impl ApiServer {
    #[must_use]
    pub fn new(manager: Arc<EnclaveManager>) -> Self {
        Self { manager }
    }

    /// Accept loop; runs until `shutdown` resolves or the listener dies.
    ///
    /// Resolving `shutdown` stops accepting and returns cleanly; already
    /// accepted connections finish on their own tasks. The caller owns
    /// whatever draining should happen after.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "API server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received, leaving accept loop");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    debug!(%peer, "client connected");
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, manager).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

// =============================================================================
// Connection handling
// =============================================================================

async fn handle_connection(mut stream: TcpStream, manager: Arc<EnclaveManager>) -> Result<()> {
    // Version agreement comes first; a mismatch is fatal for the
    // connection so a stale client fails loudly instead of misparsing.
    match read_frame::<_, Request>(&mut stream).await? {
        Some(Request::Handshake { protocol_version }) => {
            if protocol_version != PROTOCOL_VERSION {
                let error = Error::ProtocolVersionMismatch {
                    client: protocol_version,
                    server: PROTOCOL_VERSION,
                };
                write_frame(&mut stream, &Response::error(&error)).await?;
                return Err(error);
            }
            write_frame(&mut stream, &handshake_response()).await?;
        }
        Some(_) => {
            let error = Error::Protocol("first frame must be a handshake".to_string());
            write_frame(&mut stream, &Response::error(&error)).await?;
            return Err(error);
        }
        None => return Ok(()),
    }

    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        handle_request(&mut stream, &manager, request).await?;
    }
    Ok(())
}

async fn handle_request(
    stream: &mut TcpStream,
    manager: &Arc<EnclaveManager>,
    request: Request,
) -> Result<()> {
    match request {
        Request::Handshake { .. } => {
            let error = Error::Protocol("duplicate handshake".to_string());
            write_frame(stream, &Response::error(&error)).await
        }

        // ========================= Plan runs =========================
        Request::RunScript {
            enclave_id,
            script,
            params,
            dry_run,
        } => {
            let enclave = match manager.get_enclave(&EnclaveId::new(enclave_id)).await {
                Ok(enclave) => enclave,
                Err(e) => return write_frame(stream, &Response::error(&e)).await,
            };
            let provider = InMemoryContentProvider::new();
            run_plan(
                stream,
                &enclave,
                &provider,
                &script,
                DEFAULT_SCRIPT_FILENAME,
                &params,
                dry_run,
            )
            .await
        }
        Request::RunPackage {
            enclave_id,
            package_id,
            content,
            params,
            dry_run,
        } => {
            let enclave = match manager.get_enclave(&EnclaveId::new(enclave_id)).await {
                Ok(enclave) => enclave,
                Err(e) => return write_frame(stream, &Response::error(&e)).await,
            };
            let provider = match content {
                PackageContent::Local { data } => match unpack_package(&data) {
                    Ok(provider) => provider,
                    Err(e) => return write_frame(stream, &Response::error(&e)).await,
                },
                PackageContent::Remote => {
                    // Remote fetch belongs to the packaging layer in front
                    // of the runtime.
                    let error = Error::NotSupported(format!(
                        "package '{package_id}' must be provided as local content"
                    ));
                    return write_frame(stream, &Response::error(&error)).await;
                }
            };
            let script = match provider
                .get(DEFAULT_SCRIPT_FILENAME)
                .and_then(|bytes| {
                    String::from_utf8(bytes).map_err(|_| {
                        Error::Protocol(format!(
                            "package '{package_id}' has a non-UTF-8 {DEFAULT_SCRIPT_FILENAME}"
                        ))
                    })
                }) {
                Ok(script) => script,
                Err(e) => return write_frame(stream, &Response::error(&e)).await,
            };
            let file = format!("{package_id}/{DEFAULT_SCRIPT_FILENAME}");
            run_plan(stream, &enclave, &provider, &script, &file, &params, dry_run).await
        }

        // ========================= Services =========================
        Request::RegisterService {
            enclave_id,
            service_id,
            partition,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let (private_ip, relative_data_dir) = enclave
                    .network
                    .register_service(
                        &ServiceId::new(service_id),
                        partition.map(PartitionId::new),
                    )
                    .await?;
                Ok::<_, Error>(Response::ServiceRegistered {
                    private_ip: private_ip.to_string(),
                    relative_data_dir,
                })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::StartServices {
            enclave_id,
            configs,
        } => {
            let response = start_services(manager, &enclave_id, configs)
                .await
                .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::GetServices { enclave_id } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let services = enclave.network.services().await;
                Ok::<_, Error>(Response::Services {
                    services: services.iter().map(service_summary).collect(),
                })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::RemoveService {
            enclave_id,
            service_id,
            stop_timeout_secs,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let timeout = stop_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STOP_TIMEOUT);
                let guid = enclave
                    .network
                    .remove_service(&ServiceId::new(service_id), timeout)
                    .await?;
                Ok::<_, Error>(Response::ServiceRemoved {
                    guid: guid.to_string(),
                })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::Repartition {
            enclave_id,
            partition_services,
            connections,
            default_packet_loss_percentage,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;

                let partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>> = partition_services
                    .into_iter()
                    .map(|(partition, services)| {
                        (
                            PartitionId::new(partition),
                            services.into_iter().map(ServiceId::new).collect(),
                        )
                    })
                    .collect();
                let connection_map = connections
                    .into_iter()
                    .map(|spec| {
                        (
                            PartitionConnectionId::new(
                                PartitionId::new(spec.first),
                                PartitionId::new(spec.second),
                            ),
                            PartitionConnection {
                                packet_loss_percentage: spec.packet_loss_percentage,
                            },
                        )
                    })
                    .collect();
                let result = enclave
                    .network
                    .repartition(
                        partitions,
                        connection_map,
                        PartitionConnection {
                            packet_loss_percentage: default_packet_loss_percentage,
                        },
                    )
                    .await?;
                Ok::<_, Error>(Response::Repartitioned {
                    failures: result
                        .failures
                        .iter()
                        .map(|(id, e)| (id.to_string(), e.to_string()))
                        .collect(),
                })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::PauseService {
            enclave_id,
            service_id,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                enclave
                    .network
                    .pause_service(&ServiceId::new(service_id))
                    .await?;
                Ok::<_, Error>(Response::Ok {})
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::UnpauseService {
            enclave_id,
            service_id,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                enclave
                    .network
                    .unpause_service(&ServiceId::new(service_id))
                    .await?;
                Ok::<_, Error>(Response::Ok {})
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::ExecCommand {
            enclave_id,
            service_id,
            argv,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let output = enclave
                    .network
                    .exec_command(&ServiceId::new(service_id), &argv)
                    .await?;
                Ok::<_, Error>(Response::ExecResult {
                    exit_code: output.exit_code,
                    output: output.output,
                })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::WaitForHttpGetEndpointAvailability {
            enclave_id,
            service_id,
            port,
            path,
            initial_delay_ms,
            retries,
            retries_delay_ms,
            body_to_expect,
        } => {
            let response = wait_for_endpoint(
                manager,
                &enclave_id,
                &service_id,
                ProbeMethod::Get,
                port,
                &path,
                initial_delay_ms,
                retries,
                retries_delay_ms,
                None,
                body_to_expect,
            )
            .await
            .map(|()| Response::Ok {})
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::WaitForHttpPostEndpointAvailability {
            enclave_id,
            service_id,
            port,
            path,
            initial_delay_ms,
            retries,
            retries_delay_ms,
            body_to_send,
            body_to_expect,
        } => {
            let response = wait_for_endpoint(
                manager,
                &enclave_id,
                &service_id,
                ProbeMethod::Post,
                port,
                &path,
                initial_delay_ms,
                retries,
                retries_delay_ms,
                body_to_send,
                body_to_expect,
            )
            .await
            .map(|()| Response::Ok {})
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }

        // ========================= Artifacts =========================
        Request::UploadFilesArtifact { enclave_id, data } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let uuid = enclave.artifacts.store_bytes(&data)?;
                Ok::<_, Error>(Response::Artifact { uuid })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::StoreWebFilesArtifact { enclave_id, url } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let uuid = enclave.artifacts.store_web_files(&url).await?;
                Ok::<_, Error>(Response::Artifact { uuid })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::StoreFilesArtifactFromService {
            enclave_id,
            service_id,
            src_path,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let tar_bytes = enclave
                    .network
                    .copy_from_service(&ServiceId::new(service_id), &src_path)
                    .await?;
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                );
                std::io::Write::write_all(&mut encoder, &tar_bytes)
                    .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
                let tgz = encoder
                    .finish()
                    .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
                let uuid = enclave.artifacts.store_bytes(&tgz)?;
                Ok::<_, Error>(Response::Artifact { uuid })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::RenderTemplatesToFilesArtifact {
            enclave_id,
            templates,
        } => {
            let response = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let templates: Vec<(String, String, serde_json::Value)> = templates
                    .into_iter()
                    .map(|t| (t.path, t.template, t.data))
                    .collect();
                let uuid = enclave.artifacts.render_templates(&templates)?;
                Ok::<_, Error>(Response::Artifact { uuid })
            }
            .await
            .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }

        // ========================= Engine level =========================
        Request::CreateEnclave {
            enclave_id,
            partitioning_enabled,
        } => {
            let response = manager
                .create_enclave(&EnclaveId::new(enclave_id), partitioning_enabled)
                .await
                .map(|_| Response::Ok {})
                .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::DestroyEnclave { enclave_id } => {
            let response = manager
                .destroy_enclave(&EnclaveId::new(enclave_id), DEFAULT_STOP_TIMEOUT)
                .await
                .map(|()| Response::Ok {})
                .unwrap_or_else(|e| Response::error(&e));
            write_frame(stream, &response).await
        }
        Request::GetEnclaves {} => {
            let enclaves = manager.get_enclaves(&EnclaveFilters::default()).await;
            write_frame(stream, &Response::Enclaves { enclaves }).await
        }
        Request::GetServiceLogs {
            enclave_id,
            service_ids,
        } => {
            let logs = async {
                let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
                let filters = ServiceFilters {
                    ids: service_ids.into_iter().map(ServiceId::new).collect(),
                    ..ServiceFilters::default()
                };
                enclave.network.get_service_logs(&filters).await
            }
            .await;
            match logs {
                Ok(logs) => {
                    for (guid, lines) in logs {
                        for line in lines {
                            write_frame(
                                stream,
                                &Response::LogLine {
                                    guid: guid.to_string(),
                                    line,
                                },
                            )
                            .await?;
                        }
                    }
                    write_frame(stream, &Response::LogsFinished {}).await
                }
                Err(e) => write_frame(stream, &Response::error(&e)).await,
            }
        }
    }
}

// =============================================================================
// Plan runs
// =============================================================================

/// The full pipeline behind `run_script`/`run_package`: interpret, validate,
/// pre-pull, execute, stream.
async fn run_plan(
    stream: &mut TcpStream,
    enclave: &Arc<EnclaveHandle>,
    provider: &dyn ContentProvider,
    script: &str,
    file: &str,
    params: &serde_json::Value,
    dry_run: bool,
) -> Result<()> {
    let plan = match Interpreter::new(provider).interpret(script, file, params) {
        Ok(plan) => plan,
        Err(e) => {
            return send_failed_run(stream, ErrorKind::Interpretation, &e).await;
        }
    };

    let mut environment = ValidatorEnvironment::new(
        enclave
            .network
            .service_ids()
            .await
            .into_iter()
            .map(|id| id.to_string())
            .collect(),
        enclave
            .artifacts
            .list()
            .unwrap_or_default()
            .into_iter()
            .collect(),
    );
    if let Err(e) = PlanValidator::validate(&plan.instructions, &mut environment) {
        return send_failed_run(stream, ErrorKind::Validation, &e).await;
    }

    if !dry_run {
        enclave.pull_images(environment.required_images()).await;
    }

    let executor = PlanExecutor::new(Arc::clone(enclave));
    let mut lines = executor.execute(dry_run, plan.instructions, plan.return_value);
    while let Some(line) = lines.recv().await {
        write_frame(stream, &Response::Line { line }).await?;
    }
    Ok(())
}

/// Emits the one error line and its terminal run-finished line.
async fn send_failed_run(
    stream: &mut TcpStream,
    kind: ErrorKind,
    error: &Error,
) -> Result<()> {
    write_frame(
        stream,
        &Response::Line {
            line: ResponseLine::Error {
                kind,
                message: error.to_string(),
            },
        },
    )
    .await?;
    write_frame(
        stream,
        &Response::Line {
            line: ResponseLine::RunFinished {
                success: false,
                output: None,
            },
        },
    )
    .await
}

/// Unpacks an uploaded package archive into an in-memory provider.
fn unpack_package(tgz: &[u8]) -> Result<InMemoryContentProvider> {
    let mut provider = InMemoryContentProvider::new();
    let mut archive = tar::Archive::new(GzDecoder::new(tgz));
    for entry in archive
        .entries()
        .map_err(|e| Error::Protocol(format!("unreadable package archive: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| Error::Protocol(format!("unreadable package entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::Protocol(format!("bad package entry path: {e}")))?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| Error::Protocol(format!("unreadable package entry '{path}': {e}")))?;
        provider.insert(path, content);
    }
    Ok(provider)
}

// =============================================================================
// Unary helpers
// =============================================================================

async fn start_services(
    manager: &Arc<EnclaveManager>,
    enclave_id: &str,
    configs: BTreeMap<String, ServiceConfig>,
) -> Result<Response> {
    let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;

    let mut batch = BTreeMap::new();
    let mut failures: BTreeMap<String, String> = BTreeMap::new();
    for (service_id, config) in configs {
        // Volumes must exist before the container references them.
        match enclave.prepare_artifact_mounts(&config).await {
            Ok(()) => {
                batch.insert(ServiceId::new(service_id), config);
            }
            Err(e) => {
                failures.insert(service_id, e.to_string());
            }
        }
    }

    let (successes, start_failures) = enclave.network.start_services(batch).await?;
    for (service_id, e) in start_failures {
        failures.insert(service_id.to_string(), e.to_string());
    }
    Ok(Response::ServicesStarted {
        successes: successes
            .iter()
            .map(|(id, service)| (id.to_string(), service_summary(service)))
            .collect(),
        failures,
    })
}

#[allow(clippy::too_many_arguments)]
async fn wait_for_endpoint(
    manager: &Arc<EnclaveManager>,
    enclave_id: &str,
    service_id: &str,
    method: ProbeMethod,
    port: u16,
    path: &str,
    initial_delay_ms: u64,
    retries: u32,
    retries_delay_ms: u64,
    body_to_send: Option<String>,
    body_to_expect: Option<String>,
) -> Result<()> {
    let enclave = manager.get_enclave(&EnclaveId::new(enclave_id)).await?;
    enclave
        .network
        .wait_for_http_endpoint(
            &ServiceId::new(service_id),
            method,
            port,
            path,
            Duration::from_millis(initial_delay_ms),
            retries,
            Duration::from_millis(retries_delay_ms),
            body_to_send,
            body_to_expect,
        )
        .await
}

fn service_summary(service: &Service) -> ServiceSummary {
    ServiceSummary {
        service_id: service.registration.id.to_string(),
        guid: service.registration.guid.to_string(),
        status: service.status.to_string(),
        private_ip: service.registration.private_ip.to_string(),
        private_ports: service.private_ports.clone(),
        maybe_public_ip: service.maybe_public_ip.map(|ip| ip.to_string()),
        maybe_public_ports: service.maybe_public_ports.clone(),
    }
}
