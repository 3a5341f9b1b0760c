//! Plan executor.
//!
//! Drives a validated plan serially against the service network, emitting
//! one ordered stream of [`ResponseLine`]s. Future-reference tokens in each
//! instruction's string arguments are resolved immediately before the
//! instruction runs. On the first failure one error line is emitted,
//! followed by a run-finished line; earlier side effects stay (the enclave
//! is the user's state).

use super::future_ref::{resolve_string, RuntimeValueStore};
use super::instruction::{Instruction, InstructionArg, InstructionKind, InstructionPosition};
use super::value::Value;
use crate::constants::DEFAULT_STOP_TIMEOUT;
use crate::enclave::EnclaveHandle;
use crate::error::{Error, Result};
use crate::network::ProbeMethod;
use crate::service::{ServiceConfig, ServiceId};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Buffer size of the response-line stream.
const RESPONSE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Response lines
// =============================================================================

/// Which stage of the pipeline an error line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Interpretation,
    Validation,
    Execution,
}

/// One unit of the executor's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseLine {
    /// Progress marker: which step is about to run.
    Progress {
        text: String,
        step: u32,
        total: u32,
    },
    /// Canonical rendering of the instruction about to run.
    Instruction {
        position: InstructionPosition,
        name: String,
        canonical: String,
        args: Vec<InstructionArg>,
    },
    /// Short serialized result of the instruction that just ran.
    InstructionResult { result: String },
    /// The run's one error, keyed to the pipeline stage it came from.
    Error { kind: ErrorKind, message: String },
    /// Terminal line: after this the stream closes.
    RunFinished {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
}

// =============================================================================
// Executor
// =============================================================================

/// Executes validated plans against one enclave.
pub struct PlanExecutor {
    enclave: Arc<EnclaveHandle>,
    runtime_values: Arc<RuntimeValueStore>,
}

impl PlanExecutor {
    #[must_use]
    pub fn new(enclave: Arc<EnclaveHandle>) -> Self {
        Self {
            enclave,
            runtime_values: Arc::new(RuntimeValueStore::new()),
        }
    }

    /// Runs the plan, streaming response lines. The stream always ends with
    /// exactly one `RunFinished`.
    ///
    /// In dry-run mode instruction lines are still emitted but no effects
    /// run and no result lines appear.
    pub fn execute(
        &self,
        dry_run: bool,
        instructions: Vec<Instruction>,
        return_value: Value,
    ) -> mpsc::Receiver<ResponseLine> {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let enclave = Arc::clone(&self.enclave);
        let runtime_values = Arc::clone(&self.runtime_values);

        tokio::spawn(async move {
            let total = instructions.len() as u32;
            for (index, instruction) in instructions.iter().enumerate() {
                let _ = tx
                    .send(ResponseLine::Progress {
                        text: format!("Executing '{}'", instruction.name),
                        step: index as u32 + 1,
                        total,
                    })
                    .await;
                let _ = tx
                    .send(ResponseLine::Instruction {
                        position: instruction.position.clone(),
                        name: instruction.name.to_string(),
                        canonical: instruction.canonical(),
                        args: instruction.args.clone(),
                    })
                    .await;

                if dry_run {
                    continue;
                }

                match execute_instruction(&enclave, &runtime_values, instruction).await {
                    Ok(result) => {
                        debug!(instruction = %instruction.name, "instruction succeeded");
                        let _ = tx.send(ResponseLine::InstructionResult { result }).await;
                    }
                    Err(e) => {
                        let error = Error::Execution {
                            index: index + 1,
                            instruction: instruction.canonical(),
                            reason: e.to_string(),
                        };
                        let _ = tx
                            .send(ResponseLine::Error {
                                kind: ErrorKind::Execution,
                                message: error.to_string(),
                            })
                            .await;
                        let _ = tx
                            .send(ResponseLine::RunFinished {
                                success: false,
                                output: None,
                            })
                            .await;
                        return;
                    }
                }
            }

            let output = if dry_run {
                Some(return_value.to_json())
            } else {
                Some(resolve_value(&enclave, &runtime_values, return_value).await.to_json())
            };
            info!(instructions = total, dry_run, "plan run finished");
            let _ = tx
                .send(ResponseLine::RunFinished {
                    success: true,
                    output,
                })
                .await;
        });
        rx
    }
}

// =============================================================================
// Instruction effects
// =============================================================================

async fn execute_instruction(
    enclave: &Arc<EnclaveHandle>,
    runtime_values: &Arc<RuntimeValueStore>,
    instruction: &Instruction,
) -> Result<String> {
    let network = &enclave.network;

    match &instruction.kind {
        InstructionKind::AddService { service_id, config } => {
            let service_id = ServiceId::new(resolve_string(service_id, network, runtime_values).await?);
            let config = resolve_config(enclave, runtime_values, config).await?;

            network.register_service(&service_id, None).await?;
            enclave.prepare_artifact_mounts(&config).await?;
            let service = network.start_service(&service_id, config).await?;
            Ok(format!(
                "Service '{service_id}' added with guid '{}'",
                service.registration.guid
            ))
        }
        InstructionKind::RemoveService { service_id } => {
            let service_id = ServiceId::new(resolve_string(service_id, network, runtime_values).await?);
            let guid = network
                .remove_service(&service_id, DEFAULT_STOP_TIMEOUT)
                .await?;
            Ok(format!("Service '{service_id}' with guid '{guid}' removed"))
        }
        InstructionKind::RenderTemplates { name, templates } => {
            let mut resolved = Vec::with_capacity(templates.len());
            for (dest, template, data) in templates {
                resolved.push((dest.clone(), resolve_string(template, network, runtime_values).await?, data.clone()));
            }
            let artifact_uuid = enclave.artifacts.render_templates(&resolved)?;
            runtime_values.set(name, "uuid", &artifact_uuid);
            Ok(format!(
                "Templates rendered into files artifact '{name}' with uuid '{artifact_uuid}'"
            ))
        }
        InstructionKind::UploadFiles { name, src, bytes } => {
            let artifact_uuid = enclave.artifacts.store_bytes(bytes)?;
            runtime_values.set(name, "uuid", &artifact_uuid);
            Ok(format!(
                "Files from '{src}' stored as files artifact '{name}' with uuid '{artifact_uuid}'"
            ))
        }
        InstructionKind::StoreServiceFiles {
            name,
            service_id,
            src_path,
        } => {
            let service_id = ServiceId::new(resolve_string(service_id, network, runtime_values).await?);
            let src_path = resolve_string(src_path, network, runtime_values).await?;
            let tar_bytes = network.copy_from_service(&service_id, &src_path).await?;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&tar_bytes)
                .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
            let tgz = encoder
                .finish()
                .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;

            let artifact_uuid = enclave.artifacts.store_bytes(&tgz)?;
            runtime_values.set(name, "uuid", &artifact_uuid);
            Ok(format!(
                "Files from service '{service_id}' stored as files artifact '{name}' with uuid '{artifact_uuid}'"
            ))
        }
        InstructionKind::ExecCommand {
            service_id,
            command,
            result_key,
        } => {
            let service_id = ServiceId::new(resolve_string(service_id, network, runtime_values).await?);
            let mut argv = Vec::with_capacity(command.len());
            for arg in command {
                argv.push(resolve_string(arg, network, runtime_values).await?);
            }
            let output = network.exec_command(&service_id, &argv).await?;
            runtime_values.set(result_key, "output", output.output.clone());
            runtime_values.set(result_key, "code", output.exit_code.to_string());
            Ok(format!(
                "Command returned with exit code '{}'",
                output.exit_code
            ))
        }
        InstructionKind::RunSh {
            run,
            image,
            result_key,
        } => {
            let run = resolve_string(run, network, runtime_values).await?;
            run_task(
                enclave,
                runtime_values,
                image,
                vec!["sh".to_string(), "-c".to_string(), run],
                result_key,
            )
            .await
        }
        InstructionKind::RunPython {
            run,
            image,
            result_key,
        } => {
            let run = resolve_string(run, network, runtime_values).await?;
            run_task(
                enclave,
                runtime_values,
                image,
                vec!["python".to_string(), "-c".to_string(), run],
                result_key,
            )
            .await
        }
        InstructionKind::Wait {
            service_id,
            method,
            port,
            path,
            initial_delay_ms,
            retries,
            retries_delay_ms,
            body,
            expected_body,
        } => {
            let service_id = ServiceId::new(resolve_string(service_id, network, runtime_values).await?);
            let path = resolve_string(path, network, runtime_values).await?;
            let body = match body {
                Some(b) => Some(resolve_string(b, network, runtime_values).await?),
                None => None,
            };
            network
                .wait_for_http_endpoint(
                    &service_id,
                    *method,
                    *port,
                    &path,
                    Duration::from_millis(*initial_delay_ms),
                    *retries,
                    Duration::from_millis(*retries_delay_ms),
                    body,
                    expected_body.clone(),
                )
                .await?;
            let method_name = match method {
                ProbeMethod::Get => "GET",
                ProbeMethod::Post => "POST",
            };
            Ok(format!(
                "Endpoint '{method_name} :{port}/{}' on service '{service_id}' is available",
                path.trim_start_matches('/')
            ))
        }
    }
}

/// Resolves tokens in a service config and maps artifact identifiers to
/// store uuids.
async fn resolve_config(
    enclave: &Arc<EnclaveHandle>,
    runtime_values: &Arc<RuntimeValueStore>,
    config: &ServiceConfig,
) -> Result<ServiceConfig> {
    let network = &enclave.network;
    let mut resolved = config.clone();

    resolved.image = resolve_string(&config.image, network, runtime_values).await?;
    if let Some(entrypoint) = &config.entrypoint {
        let mut items = Vec::with_capacity(entrypoint.len());
        for item in entrypoint {
            items.push(resolve_string(item, network, runtime_values).await?);
        }
        resolved.entrypoint = Some(items);
    }
    if let Some(cmd) = &config.cmd {
        let mut items = Vec::with_capacity(cmd.len());
        for item in cmd {
            items.push(resolve_string(item, network, runtime_values).await?);
        }
        resolved.cmd = Some(items);
    }
    let mut env = std::collections::HashMap::with_capacity(config.env.len());
    for (key, value) in &config.env {
        env.insert(
            key.clone(),
            resolve_string(value, network, runtime_values).await?,
        );
    }
    resolved.env = env;

    // Artifact identifiers become store uuids: plan-declared names go
    // through the runtime-value registry, anything else must already be a
    // stored uuid.
    let mut mounts = BTreeMap::new();
    for (artifact_id, mountpoint) in &config.files_artifact_mounts {
        let uuid = match runtime_values.get(artifact_id, "uuid") {
            Some(uuid) => uuid,
            None if enclave.artifacts.exists(artifact_id) => artifact_id.clone(),
            None => return Err(Error::ArtifactNotFound(artifact_id.clone())),
        };
        mounts.insert(
            uuid,
            resolve_string(mountpoint, network, runtime_values).await?,
        );
    }
    resolved.files_artifact_mounts = mounts;
    Ok(resolved)
}

/// Runs a one-off task container: start, exec the payload, tear down.
async fn run_task(
    enclave: &Arc<EnclaveHandle>,
    runtime_values: &Arc<RuntimeValueStore>,
    image: &str,
    argv: Vec<String>,
    result_key: &str,
) -> Result<String> {
    let network = &enclave.network;
    let task_id = ServiceId::new(format!(
        "task-{}",
        uuid::Uuid::new_v4().simple().to_string().split_at(12).0
    ));

    network.register_service(&task_id, None).await?;
    let config = ServiceConfig {
        image: image.to_string(),
        // The container idles; the payload runs through exec so its output
        // and exit code can be captured.
        cmd: Some(vec!["sleep".to_string(), "3600".to_string()]),
        ..ServiceConfig::default()
    };
    let task_result = async {
        network.start_service(&task_id, config).await?;
        network.exec_command(&task_id, &argv).await
    }
    .await;

    // The task container is scratch either way.
    if let Err(e) = network.remove_service(&task_id, Duration::from_secs(0)).await {
        tracing::warn!(task = %task_id, error = %e, "failed to remove task container");
    }

    let output = task_result?;
    runtime_values.set(result_key, "output", output.output.clone());
    runtime_values.set(result_key, "code", output.exit_code.to_string());
    Ok(format!(
        "Command returned with exit code '{}'",
        output.exit_code
    ))
}

/// Resolves future-reference tokens inside a return value, leaving
/// unresolvable tokens in place rather than failing a successful run.
///
/// Boxed because values nest arbitrarily deep.
fn resolve_value<'a>(
    enclave: &'a Arc<EnclaveHandle>,
    runtime_values: &'a Arc<RuntimeValueStore>,
    value: Value,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::String(s) => {
                match resolve_string(&s, &enclave.network, runtime_values).await {
                    Ok(resolved) => Value::String(resolved),
                    Err(_) => Value::String(s),
                }
            }
            Value::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_value(enclave, runtime_values, item).await);
                }
                Value::List(resolved)
            }
            Value::Dict(entries) => {
                let mut resolved = BTreeMap::new();
                for (key, item) in entries {
                    resolved.insert(key, resolve_value(enclave, runtime_values, item).await);
                }
                Value::Dict(resolved)
            }
            Value::Struct { kind, fields } => {
                let mut resolved = BTreeMap::new();
                for (key, item) in fields {
                    resolved.insert(key, resolve_value(enclave, runtime_values, item).await);
                }
                Value::Struct {
                    kind,
                    fields: resolved,
                }
            }
            other => other,
        }
    })
}
