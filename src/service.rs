//! Service identity and lifecycle types.
//!
//! A service is the logical unit managed inside an enclave. Its identity is
//! the pair (service id, service guid): the id is human-chosen and unique
//! within one enclave, the guid is an opaque globally-unique token minted at
//! registration time.
//!
//! Lifecycle per guid (transitions are monotonic, there is no reuse):
//!
//! ```text
//!              register
//!      ∅ ───────────────▶ Registered
//!                             │  start
//!                             ▼
//!                          Running ──stop──▶ Stopped
//!                             │                  │
//!                             └──── destroy ─────┴──▶ Destroyed
//! ```

use crate::port_spec::PortSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

// =============================================================================
// Service ID
// =============================================================================

/// Human-chosen service identifier, unique within an enclave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Service GUID
// =============================================================================

/// Globally-unique opaque token for one registration of a service.
///
/// Formed as `<service-id>-<uuid-simple>` so backend object names stay
/// readable while still being collision-free across enclaves and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceGuid(String);

impl ServiceGuid {
    /// Mints a fresh guid for the given service id.
    #[must_use]
    pub fn mint(service_id: &ServiceId) -> Self {
        Self(format!(
            "{}-{}",
            service_id.as_str(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Wraps an existing guid string (backend object recovery).
    #[must_use]
    pub fn from_string(guid: impl Into<String>) -> Self {
        Self(guid.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Service Status
// =============================================================================

/// Lifecycle state of one service guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Guid allocated and private IP reserved; no container yet.
    Registered,
    /// A container is attached to the registration.
    Running,
    /// Container gone; the registration is retained as a tombstone.
    Stopped,
    /// Container and registration both removed.
    Destroyed,
}

impl ServiceStatus {
    /// Whether the monotonic state machine permits `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::{Destroyed, Registered, Running, Stopped};
        matches!(
            (self, next),
            (Registered, Running)
                | (Registered, Destroyed)
                | (Running, Stopped)
                | (Running, Destroyed)
                | (Stopped, Destroyed)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Matches the serde name so log lines and wire values stay identical.
        let name = match self {
            ServiceStatus::Registered => "registered",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Destroyed => "destroyed",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Registration
// =============================================================================

/// The durable half of a service: guid, id and the reserved private IP.
///
/// The private IP is immutable for the life of the guid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub guid: ServiceGuid,
    pub id: ServiceId,
    pub enclave_id: String,
    pub private_ip: Ipv4Addr,
}

impl ServiceRegistration {
    /// Relative path (under the enclave data dir) of this service's scratch
    /// directory.
    #[must_use]
    pub fn relative_data_dir(&self) -> String {
        format!("{}/{}", crate::constants::SERVICES_DIRNAME, self.guid)
    }
}

// =============================================================================
// Service
// =============================================================================

/// A registered service plus whatever run state it has accumulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub registration: ServiceRegistration,
    pub status: ServiceStatus,
    /// Image the container was started from (set once running).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    /// Declared private ports, keyed by port id.
    pub private_ports: BTreeMap<String, PortSpec>,
    /// Public IP where published ports are reachable, if any were published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maybe_public_ip: Option<Ipv4Addr>,
    /// Public port mapping; shares its key set with `private_ports` once
    /// publication is known.
    pub maybe_public_ports: BTreeMap<String, PortSpec>,
}

impl Service {
    /// A freshly-registered service with no container.
    #[must_use]
    pub fn registered(registration: ServiceRegistration) -> Self {
        Self {
            registration,
            status: ServiceStatus::Registered,
            container_image: None,
            private_ports: BTreeMap::new(),
            maybe_public_ip: None,
            maybe_public_ports: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Service Config
// =============================================================================

/// Everything needed to start a registered service's container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Container image reference.
    pub image: String,
    /// Private ports to open, keyed by port id.
    pub private_ports: BTreeMap<String, PortSpec>,
    /// Entrypoint override, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Command arguments, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Files-artifact uuid → mount path inside the container.
    pub files_artifact_mounts: BTreeMap<String, String>,
    /// CPU allocation in millicores (0 = unlimited).
    pub cpu_allocation_millicpus: u64,
    /// Memory allocation in megabytes (0 = unlimited).
    pub memory_allocation_megabytes: u64,
    /// Static public port requests, keyed by port id. Optional; honored by
    /// the daemon backend only.
    pub maybe_static_public_ports: BTreeMap<String, PortSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_embeds_service_id() {
        let id = ServiceId::new("db");
        let guid = ServiceGuid::mint(&id);
        assert!(guid.as_str().starts_with("db-"));
        assert!(guid.as_str().len() > "db-".len());
    }

    #[test]
    fn test_guids_are_unique() {
        let id = ServiceId::new("db");
        assert_ne!(ServiceGuid::mint(&id), ServiceGuid::mint(&id));
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ServiceStatus::*;
        assert!(Registered.can_transition_to(Running));
        assert!(Registered.can_transition_to(Destroyed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Destroyed));
        assert!(Stopped.can_transition_to(Destroyed));

        // No reverse edges, no self edges, nothing out of a tombstone's grave.
        assert!(!Running.can_transition_to(Registered));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Destroyed.can_transition_to(Registered));
        assert!(!Registered.can_transition_to(Registered));
        assert!(!Registered.can_transition_to(Stopped));
    }
}
