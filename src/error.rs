//! Error types for the enclave runtime.

use std::path::PathBuf;

/// Result type alias for enclave runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the enclave runtime.
///
/// Variants are grouped by the layer they originate from. Plan-pipeline
/// errors (interpretation, validation, execution) carry the script position
/// where applicable so they can be surfaced to clients as response lines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Enclave Errors
    // =========================================================================
    /// Enclave not found.
    #[error("enclave not found: {0}")]
    EnclaveNotFound(String),

    /// Enclave already exists.
    #[error("enclave already exists: {0}")]
    EnclaveAlreadyExists(String),

    /// Enclave create failed.
    #[error("failed to create enclave '{id}': {reason}")]
    EnclaveCreateFailed { id: String, reason: String },

    // =========================================================================
    // Service Lifecycle Errors
    // =========================================================================
    /// Service not found.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Service id already registered in the enclave.
    #[error("service already registered: {0}")]
    ServiceAlreadyRegistered(String),

    /// Service registration failed.
    #[error("failed to register service '{id}': {reason}")]
    RegistrationFailed { id: String, reason: String },

    /// Service start failed.
    #[error("failed to start service '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Service is in the wrong state for the requested operation.
    #[error("service '{guid}' is in state '{state}', expected '{expected}'")]
    InvalidServiceState {
        guid: String,
        state: String,
        expected: String,
    },

    /// Service stop failed.
    #[error("failed to stop service '{guid}': {reason}")]
    StopFailed { guid: String, reason: String },

    /// Service destroy failed.
    #[error("failed to destroy service '{guid}': {reason}")]
    DestroyFailed { guid: String, reason: String },

    /// Exec inside a service failed.
    #[error("exec failed in service '{service}': {reason}")]
    ExecFailed { service: String, reason: String },

    /// Exec output exceeded the deterministic-log bound.
    #[error("exec output in service '{service}' exceeded {limit} bytes")]
    ExecOutputTooLarge { service: String, limit: usize },

    // =========================================================================
    // Network / Topology Errors
    // =========================================================================
    /// The enclave subnet has no free IPs left.
    #[error("no free IP addresses remain in subnet {subnet}")]
    IpPoolExhausted { subnet: String },

    /// Attempt to release an IP that was never allocated from the pool.
    #[error("IP address {0} does not belong to this allocator")]
    IpNotAllocated(String),

    /// Referenced partition does not exist in the topology.
    #[error("partition not found: {0}")]
    PartitionNotFound(String),

    /// Topology is structurally invalid.
    #[error("invalid partition topology: {0}")]
    InvalidTopology(String),

    /// Network partitioning was disabled for this enclave.
    #[error("network partitioning is disabled for enclave '{0}'")]
    PartitioningDisabled(String),

    /// Sidecar traffic-shaping operation failed.
    #[error("sidecar operation failed for service '{service}': {reason}")]
    SidecarFailed { service: String, reason: String },

    /// HTTP endpoint never became available within the retry budget.
    #[error("endpoint '{url}' not available after {retries} retries: {reason}")]
    EndpointUnavailable {
        url: String,
        retries: u32,
        reason: String,
    },

    // =========================================================================
    // Plan Pipeline Errors
    // =========================================================================
    /// Script could not be interpreted (parse error, unknown built-in,
    /// bad arguments). No side effects have occurred.
    #[error("interpretation error at {file}[{line}:{column}]: {message}")]
    Interpretation {
        file: String,
        line: u32,
        column: u32,
        message: String,
    },

    /// A symbolic validation check failed before execution.
    #[error("validation error at {file}[{line}:{column}]: {message}")]
    Validation {
        file: String,
        line: u32,
        column: u32,
        message: String,
    },

    /// An instruction failed while executing against the enclave.
    #[error("error executing instruction (number {index}):\n{instruction}\n{reason}")]
    Execution {
        index: usize,
        instruction: String,
        reason: String,
    },

    /// An unresolved future-reference token survived to execution time.
    #[error("unresolvable reference '{token}': {reason}")]
    UnresolvableReference { token: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Backend object not found (demoted to a no-op by destroy paths).
    #[error("{resource} not found: {identifier}")]
    BackendObjectNotFound {
        resource: &'static str,
        identifier: String,
    },

    /// The backend request itself could not be issued.
    #[error("backend request failed: {0}")]
    BackendRequestFailed(String),

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// The backend driver binary is missing or unusable.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    // =========================================================================
    // Artifact / Storage Errors
    // =========================================================================
    /// Files artifact not found in the store.
    #[error("files artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Artifact identifier collision.
    #[error("files artifact already exists: {0}")]
    ArtifactAlreadyExists(String),

    /// Store initialization failed.
    #[error("failed to initialize artifact store at {path}: {reason}")]
    StoreInitFailed { path: PathBuf, reason: String },

    /// Store write failed; any partial file has been removed.
    #[error("failed to write artifact: {0}")]
    StoreWriteFailed(String),

    /// Template rendering failed.
    #[error("failed to render template for '{path}': {reason}")]
    TemplateRenderFailed { path: String, reason: String },

    // =========================================================================
    // Port Spec Errors
    // =========================================================================
    /// A port spec string could not be parsed. Names the bad token.
    #[error("invalid port spec '{spec}': {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    // =========================================================================
    // Configuration / Protocol Errors
    // =========================================================================
    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed protocol frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Client and server disagree on the protocol version.
    #[error("protocol version mismatch: client {client}, server {server}")]
    ProtocolVersionMismatch { client: u32, server: u32 },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Graceful shutdown did not complete cleanly.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that destroy/stop paths demote to a no-op.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EnclaveNotFound(_)
                | Error::ServiceNotFound(_)
                | Error::ArtifactNotFound(_)
                | Error::BackendObjectNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
