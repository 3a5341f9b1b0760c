//! Constants for the enclave runtime.
//!
//! All limits, timeouts, label keys and chain names live here so they stay
//! consistent across backends and versions.

use std::time::Duration;

// =============================================================================
// Backend Object Label Keys
// =============================================================================
// !!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!! DO NOT CHANGE THESE VALUES !!!!!!!!!!!!!!!!!
// These keys identify runtime-owned objects on the container backend. If a
// key changes, the runtime loses track of objects created by prior versions,
// leaking containers, networks and volumes on the user's machine.
//
// If you add a new immutable key here, UPDATE THE LABEL UNIT TEST.
// !!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!! DO NOT CHANGE THESE VALUES !!!!!!!!!!!!!!!!!

/// Prefix shared by every label key the runtime writes.
pub const LABEL_KEY_PREFIX: &str = "enclaverun.dev/";

/// Identifies the application that owns the object.
pub const APP_ID_LABEL_KEY: &str = "enclaverun.dev/app-id";

/// Value written under [`APP_ID_LABEL_KEY`] for every object.
pub const APP_ID_LABEL_VALUE: &str = "enclaverun";

/// The kind of runtime resource (network, user-service, sidecar, ...).
pub const RESOURCE_TYPE_LABEL_KEY: &str = "enclaverun.dev/resource-type";

/// The enclave the object belongs to.
pub const ENCLAVE_ID_LABEL_KEY: &str = "enclaverun.dev/enclave-id";

/// Globally-unique token of the object (service guid, sidecar guid, ...).
pub const GUID_LABEL_KEY: &str = "enclaverun.dev/guid";

/// Human-chosen id of the object, when one exists.
pub const ID_LABEL_KEY: &str = "enclaverun.dev/id";

/// Serialized private port specs of a service container.
pub const PORT_SPECS_LABEL_KEY: &str = "enclaverun.dev/ports";

/// The private IP reserved for a service registration.
pub const PRIVATE_IP_LABEL_KEY: &str = "enclaverun.dev/private-ip";

/// Whether the owning enclave was created with partitioning enabled.
pub const PARTITIONING_ENABLED_LABEL_KEY: &str =
    "enclaverun.dev/is-network-partitioning-enabled";

// =============================================================================
// Resource Type Label Values
// =============================================================================

/// Label value for enclave networks.
pub const RESOURCE_TYPE_NETWORK: &str = "enclave-network";

/// Label value for user service containers.
pub const RESOURCE_TYPE_USER_SERVICE: &str = "user-service";

/// Label value for traffic-shaping sidecar containers.
pub const RESOURCE_TYPE_SIDECAR: &str = "networking-sidecar";

/// Label value for files-artifact volumes.
pub const RESOURCE_TYPE_ARTIFACT_VOLUME: &str = "files-artifact-volume";

/// Label value for artifact-expander helper containers.
pub const RESOURCE_TYPE_EXPANDER: &str = "files-artifact-expander";

// =============================================================================
// Packet Filter Chains
// =============================================================================
// Two chains exist per sidecar so one can be flushed and rebuilt while the
// other stays live; the swap is a single rule replacement.

/// First packet-filter chain.
pub const FILTER_CHAIN_1: &str = "ENCLAVERUN1";

/// Second packet-filter chain.
pub const FILTER_CHAIN_2: &str = "ENCLAVERUN2";

/// The chain made live when a sidecar is initialized.
pub const INITIAL_FILTER_CHAIN: &str = FILTER_CHAIN_1;

// =============================================================================
// Size Limits
// =============================================================================

/// Hard cap on captured exec output. Larger output is rejected with an
/// execution error rather than truncated, to keep logs deterministic.
pub const MAX_EXEC_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum uploaded files-artifact size (512 MiB).
pub const MAX_ARTIFACT_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum plan script size (1 MiB).
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;

/// Maximum single protocol frame size (64 MiB, bounds upload frames).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum services startable in one batch request.
pub const MAX_BATCH_START_SERVICES: usize = 256;

// =============================================================================
// Concurrency
// =============================================================================

/// Bound on parallel per-service work inside batch operations
/// (`start_services`, repartition pushes, bulk destroy).
pub const MAX_PARALLEL_SERVICE_OPS: usize = 8;

// =============================================================================
// Timeouts
// =============================================================================

/// Grace period before a stop escalates to a kill.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single exec inside a service or sidecar.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for best-effort image pulls.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-request connect timeout for HTTP availability probes.
pub const HTTP_PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the enclave drain performed at shutdown. A wedged backend must
/// not keep the process alive past this.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Enclave Data Directory Layout
// =============================================================================

/// Subdirectory holding stored files artifacts.
pub const FILES_ARTIFACTS_DIRNAME: &str = "files-artifacts";

/// Subdirectory holding per-service scratch directories.
pub const SERVICES_DIRNAME: &str = "services";

/// Subdirectory holding helper-runtime scratch directories.
pub const MODULES_DIRNAME: &str = "modules";

// =============================================================================
// Exit Codes
// =============================================================================

/// Clean shutdown.
pub const EXIT_CODE_SUCCESS: u8 = 0;

/// The runtime failed to start (bad config, backend unavailable).
pub const EXIT_CODE_STARTUP_ERROR: u8 = 1;

/// A required operation hit its timeout.
pub const EXIT_CODE_TIMEOUT: u8 = 2;

/// Shutdown did not complete cleanly.
pub const EXIT_CODE_SHUTDOWN_ERROR: u8 = 3;

/// A status transition arrived out of order.
pub const EXIT_CODE_OUT_OF_ORDER_STATUS: u8 = 4;

// =============================================================================
// Future-Reference Tokens
// =============================================================================

/// Opening delimiter of a future-reference token.
pub const FUTURE_REF_PREFIX: &str = "{{";

/// Closing delimiter of a future-reference token.
pub const FUTURE_REF_SUFFIX: &str = "}}";

// =============================================================================
// Protocol
// =============================================================================

/// Wire protocol version. Bumped only on incompatible frame changes.
pub const PROTOCOL_VERSION: u32 = 1;
