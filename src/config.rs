//! Runtime configuration, read from the environment.
//!
//! The runtime is launched per enclave by an outer supervisor, so
//! configuration is a flat set of environment variables rather than a file.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Environment variable naming the backend type (`daemon` | `cluster`).
pub const ENV_BACKEND: &str = "ENCLAVERUN_BACKEND";

/// Environment variable naming the log level.
pub const ENV_LOG_LEVEL: &str = "ENCLAVERUN_LOG_LEVEL";

/// Environment variable naming the API listen port.
pub const ENV_LISTEN_PORT: &str = "ENCLAVERUN_LISTEN_PORT";

/// Environment variable naming the enclave this runtime serves.
pub const ENV_ENCLAVE_ID: &str = "ENCLAVERUN_ENCLAVE_ID";

/// Environment variable enabling network partitioning for the enclave.
pub const ENV_PARTITIONING_ENABLED: &str = "ENCLAVERUN_PARTITIONING_ENABLED";

/// Environment variable overriding the data directory root.
pub const ENV_DATA_DIR: &str = "ENCLAVERUN_DATA_DIR";

/// Which container backend implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// A container daemon on the local host.
    Daemon,
    /// A cluster scheduler.
    Cluster,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Daemon => write!(f, "daemon"),
            BackendType::Cluster => write!(f, "cluster"),
        }
    }
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backend_type: BackendType,
    pub log_level: String,
    pub listen_port: u16,
    pub enclave_id: String,
    pub partitioning_enabled: bool,
    pub data_dir: PathBuf,
}

impl RuntimeConfig {
    /// Reads configuration from the environment.
    ///
    /// Missing optional variables fall back to defaults; malformed values
    /// are hard errors so the binary fails fast at startup.
    pub fn from_env() -> Result<Self> {
        let backend_type = match std::env::var(ENV_BACKEND).as_deref() {
            Ok("daemon") | Err(_) => BackendType::Daemon,
            Ok("cluster") => BackendType::Cluster,
            Ok(other) => {
                return Err(Error::InvalidConfig(format!(
                    "{ENV_BACKEND} must be 'daemon' or 'cluster', got '{other}'"
                )))
            }
        };

        let log_level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string());

        let listen_port = match std::env::var(ENV_LISTEN_PORT) {
            Ok(raw) => raw.parse::<u16>().map_err(|_| {
                Error::InvalidConfig(format!(
                    "{ENV_LISTEN_PORT} must be a port number, got '{raw}'"
                ))
            })?,
            Err(_) => 7443,
        };

        let enclave_id = std::env::var(ENV_ENCLAVE_ID)
            .map_err(|_| Error::InvalidConfig(format!("{ENV_ENCLAVE_ID} must be set")))?;
        if enclave_id.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{ENV_ENCLAVE_ID} must not be empty"
            )));
        }

        let partitioning_enabled = match std::env::var(ENV_PARTITIONING_ENABLED).as_deref() {
            Ok("true") | Ok("1") => true,
            Ok("false") | Ok("0") | Err(_) => false,
            Ok(other) => {
                return Err(Error::InvalidConfig(format!(
                    "{ENV_PARTITIONING_ENABLED} must be a boolean, got '{other}'"
                )))
            }
        };

        let data_dir = match std::env::var(ENV_DATA_DIR) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir(),
        };

        Ok(Self {
            backend_type,
            log_level,
            listen_port,
            enclave_id,
            partitioning_enabled,
            data_dir,
        })
    }
}

/// Returns the platform-appropriate data directory root.
fn default_data_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        home.join(".enclaverun").join("data")
    } else {
        PathBuf::from(".enclaverun/data")
    }
}
