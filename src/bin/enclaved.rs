//! enclaved - the enclave runtime server.
//!
//! Boots one enclave runtime: reads configuration from the environment,
//! constructs the configured container backend, creates the enclave this
//! process serves, and listens for API connections until a shutdown signal
//! arrives. On SIGTERM/SIGINT the accept loop stops and the enclave is
//! drained (services stopped with their grace period) before exit.
//!
//! ## Environment
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `ENCLAVERUN_BACKEND` | `daemon` or `cluster` | `daemon` |
//! | `ENCLAVERUN_LOG_LEVEL` | tracing filter | `info` |
//! | `ENCLAVERUN_LISTEN_PORT` | API TCP port | `7443` |
//! | `ENCLAVERUN_ENCLAVE_ID` | enclave this runtime serves | required |
//! | `ENCLAVERUN_PARTITIONING_ENABLED` | enable repartitioning | `false` |
//! | `ENCLAVERUN_DATA_DIR` | data directory root | `~/.enclaverun/data` |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | clean shutdown |
//! | 1 | startup error |
//! | 2 | a bounded operation (shutdown drain, pull) timed out |
//! | 3 | shutdown drain failed |
//! | 4 | a service status transition arrived out of order |

use enclaverun::backend::{ClusterBackend, ContainerBackend, DaemonBackend};
use enclaverun::config::{BackendType, RuntimeConfig};
use enclaverun::constants::{
    DEFAULT_STOP_TIMEOUT, EXIT_CODE_OUT_OF_ORDER_STATUS, EXIT_CODE_SHUTDOWN_ERROR,
    EXIT_CODE_STARTUP_ERROR, EXIT_CODE_SUCCESS, EXIT_CODE_TIMEOUT, SHUTDOWN_TIMEOUT,
};
use enclaverun::enclave::{EnclaveId, EnclaveManager};
use enclaverun::server::ApiServer;
use enclaverun::Error;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("enclaved: {e}");
            return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::from(EXIT_CODE_SUCCESS),
        Err(e) => {
            error!(error = %e, "runtime exited with error");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Maps a runtime error to the differentiated exit codes.
fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::Timeout { .. } => EXIT_CODE_TIMEOUT,
        Error::ShutdownFailed(_) => EXIT_CODE_SHUTDOWN_ERROR,
        Error::InvalidServiceState { .. } => EXIT_CODE_OUT_OF_ORDER_STATUS,
        _ => EXIT_CODE_STARTUP_ERROR,
    }
}

async fn serve(config: RuntimeConfig) -> enclaverun::Result<()> {
    let backend: Arc<dyn ContainerBackend> = match config.backend_type {
        BackendType::Daemon => Arc::new(DaemonBackend::new()),
        BackendType::Cluster => Arc::new(ClusterBackend::new()),
    };
    info!(backend = backend.name(), enclave = %config.enclave_id, "starting enclave runtime");

    let manager = Arc::new(EnclaveManager::new(
        Arc::clone(&backend),
        config.data_dir.clone(),
    ));
    let enclave_id = EnclaveId::new(config.enclave_id.clone());
    manager
        .create_enclave(&enclave_id, config.partitioning_enabled)
        .await?;

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    let serve_result = ApiServer::new(Arc::clone(&manager))
        .serve(listener, shutdown_signal())
        .await;

    // Drain the enclave whichever way the accept loop ended, bounded so a
    // wedged backend cannot hang the process.
    info!(enclave = %enclave_id, "draining enclave");
    let drain = manager.destroy_enclave(&enclave_id, DEFAULT_STOP_TIMEOUT);
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
        Ok(Ok(())) => serve_result,
        Ok(Err(e)) => Err(Error::ShutdownFailed(e.to_string())),
        Err(_) => Err(Error::Timeout {
            operation: "enclave drain on shutdown".to_string(),
            duration: SHUTDOWN_TIMEOUT,
        }),
    }
}

/// Resolves when a shutdown signal arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
            }
        }
        _ => {
            tracing::warn!("cannot install signal handlers, watching interrupt only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Resolves when a shutdown signal arrives.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt, initiating shutdown");
    }
}
