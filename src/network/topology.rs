//! Partition topology: which services may talk to which.
//!
//! Services live in named partitions; between any unordered pair of
//! partitions a connection carries a packet-loss percentage. A loss of 100
//! means the pair is fully partitioned. Intermediate loss values are carried
//! through the model but enforcement is currently binary.

use crate::error::{Error, Result};
use crate::service::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// The partition services land in when none is named.
pub const DEFAULT_PARTITION_ID: &str = "default";

// =============================================================================
// Partition ID
// =============================================================================

/// Name of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default partition.
    #[must_use]
    pub fn default_partition() -> Self {
        Self(DEFAULT_PARTITION_ID.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Connections
// =============================================================================

/// Unordered pair of partitions. Constructed sorted so (A,B) == (B,A).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    first: PartitionId,
    second: PartitionId,
}

impl PartitionConnectionId {
    #[must_use]
    pub fn new(a: PartitionId, b: PartitionId) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// True if this is a self-pair (A,A).
    #[must_use]
    pub fn is_self_pair(&self) -> bool {
        self.first == self.second
    }
}

/// Quality of the link between two partitions.
///
/// Only packet loss is modeled today; other QoS knobs are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionConnection {
    /// Packet loss percentage in `[0, 100]`.
    pub packet_loss_percentage: f32,
}

impl PartitionConnection {
    /// Unimpeded connection.
    #[must_use]
    pub fn open() -> Self {
        Self {
            packet_loss_percentage: 0.0,
        }
    }

    /// Full partition.
    #[must_use]
    pub fn blocked() -> Self {
        Self {
            packet_loss_percentage: 100.0,
        }
    }

    /// Enforcement is binary: only total loss blocks traffic.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.packet_loss_percentage >= 100.0
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.packet_loss_percentage) {
            return Err(Error::InvalidTopology(format!(
                "packet loss percentage {} is outside [0, 100]",
                self.packet_loss_percentage
            )));
        }
        Ok(())
    }
}

impl Default for PartitionConnection {
    fn default() -> Self {
        Self::open()
    }
}

// =============================================================================
// Topology
// =============================================================================

/// The complete partitioning state of one enclave.
///
/// Replaced atomically by repartition: either the whole new topology is
/// valid and installed, or the old one stays.
#[derive(Debug, Clone)]
pub struct PartitionTopology {
    /// Partition → services inside it.
    partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
    /// Reverse map, kept in lockstep.
    service_partitions: HashMap<ServiceId, PartitionId>,
    /// Explicit pairwise connections.
    connections: HashMap<PartitionConnectionId, PartitionConnection>,
    /// Connection assumed for pairs without an explicit entry.
    default_connection: PartitionConnection,
}

impl PartitionTopology {
    /// A topology with only the default partition and open connections.
    #[must_use]
    pub fn flat() -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(PartitionId::default_partition(), BTreeSet::new());
        Self {
            partitions,
            service_partitions: HashMap::new(),
            connections: HashMap::new(),
            default_connection: PartitionConnection::open(),
        }
    }

    /// Builds a full topology from its parts, validating invariants:
    /// no service in two partitions, no connection naming an unknown
    /// partition, loss percentages in range.
    pub fn new(
        partition_services: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
        connections: HashMap<PartitionConnectionId, PartitionConnection>,
        default_connection: PartitionConnection,
    ) -> Result<Self> {
        if partition_services.is_empty() {
            return Err(Error::InvalidTopology(
                "a topology needs at least one partition".to_string(),
            ));
        }
        default_connection.validate()?;

        let mut service_partitions = HashMap::new();
        for (partition, services) in &partition_services {
            for service in services {
                if let Some(previous) = service_partitions.insert(service.clone(), partition.clone())
                {
                    return Err(Error::InvalidTopology(format!(
                        "service '{service}' appears in partitions '{previous}' and '{partition}'"
                    )));
                }
            }
        }

        for (pair, connection) in &connections {
            connection.validate()?;
            for partition in [&pair.first, &pair.second] {
                if !partition_services.contains_key(partition) {
                    return Err(Error::PartitionNotFound(partition.to_string()));
                }
            }
            if pair.is_self_pair() && connection.is_blocked() {
                return Err(Error::InvalidTopology(format!(
                    "partition '{}' cannot be blocked from itself",
                    pair.first
                )));
            }
        }

        Ok(Self {
            partitions: partition_services,
            service_partitions,
            connections,
            default_connection,
        })
    }

    /// Adds a service to an existing partition.
    pub fn add_service(&mut self, service: ServiceId, partition: &PartitionId) -> Result<()> {
        let members = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| Error::PartitionNotFound(partition.to_string()))?;
        members.insert(service.clone());
        self.service_partitions.insert(service, partition.clone());
        Ok(())
    }

    /// Removes a service and its partition mapping. Unknown services are a
    /// no-op.
    pub fn remove_service(&mut self, service: &ServiceId) {
        if let Some(partition) = self.service_partitions.remove(service) {
            if let Some(members) = self.partitions.get_mut(&partition) {
                members.remove(service);
            }
        }
    }

    /// The partition a service belongs to.
    #[must_use]
    pub fn partition_of(&self, service: &ServiceId) -> Option<&PartitionId> {
        self.service_partitions.get(service)
    }

    /// The effective connection between two partitions.
    #[must_use]
    pub fn connection(&self, a: &PartitionId, b: &PartitionId) -> PartitionConnection {
        if a == b {
            // Self-pair is never impeded.
            return PartitionConnection::open();
        }
        let pair = PartitionConnectionId::new(a.clone(), b.clone());
        self.connections
            .get(&pair)
            .copied()
            .unwrap_or(self.default_connection)
    }

    /// Every service in the topology.
    pub fn services(&self) -> impl Iterator<Item = &ServiceId> {
        self.service_partitions.keys()
    }

    /// Computes the services `service` must not reach: every service in a
    /// partition whose connection to `service`'s partition is blocked.
    #[must_use]
    pub fn blocked_services(&self, service: &ServiceId) -> BTreeSet<ServiceId> {
        let Some(own_partition) = self.partition_of(service) else {
            return BTreeSet::new();
        };
        let mut blocked = BTreeSet::new();
        for (partition, members) in &self.partitions {
            if !self.connection(own_partition, partition).is_blocked() {
                continue;
            }
            for other in members {
                if other != service {
                    blocked.insert(other.clone());
                }
            }
        }
        blocked
    }
}

impl Default for PartitionTopology {
    fn default() -> Self {
        Self::flat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_partition_topology(loss: f32) -> PartitionTopology {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            PartitionId::new("p1"),
            BTreeSet::from([ServiceId::new("a")]),
        );
        partitions.insert(
            PartitionId::new("p2"),
            BTreeSet::from([ServiceId::new("b"), ServiceId::new("c")]),
        );
        let connections = HashMap::from([(
            PartitionConnectionId::new(PartitionId::new("p1"), PartitionId::new("p2")),
            PartitionConnection {
                packet_loss_percentage: loss,
            },
        )]);
        PartitionTopology::new(partitions, connections, PartitionConnection::open()).unwrap()
    }

    #[test]
    fn test_connection_id_is_symmetric() {
        let ab = PartitionConnectionId::new(PartitionId::new("a"), PartitionId::new("b"));
        let ba = PartitionConnectionId::new(PartitionId::new("b"), PartitionId::new("a"));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_blocked_services_across_partitions() {
        let topology = two_partition_topology(100.0);
        let blocked = topology.blocked_services(&ServiceId::new("a"));
        assert_eq!(
            blocked,
            BTreeSet::from([ServiceId::new("b"), ServiceId::new("c")])
        );
        // Symmetric from the other side.
        let blocked = topology.blocked_services(&ServiceId::new("b"));
        assert_eq!(blocked, BTreeSet::from([ServiceId::new("a")]));
    }

    #[test]
    fn test_partial_loss_is_not_blocked() {
        let topology = two_partition_topology(50.0);
        assert!(topology.blocked_services(&ServiceId::new("a")).is_empty());
    }

    #[test]
    fn test_same_partition_never_blocked() {
        let topology = two_partition_topology(100.0);
        let blocked = topology.blocked_services(&ServiceId::new("b"));
        assert!(!blocked.contains(&ServiceId::new("c")));
    }

    #[test]
    fn test_service_in_two_partitions_rejected() {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            PartitionId::new("p1"),
            BTreeSet::from([ServiceId::new("a")]),
        );
        partitions.insert(
            PartitionId::new("p2"),
            BTreeSet::from([ServiceId::new("a")]),
        );
        let result =
            PartitionTopology::new(partitions, HashMap::new(), PartitionConnection::open());
        assert!(matches!(result, Err(Error::InvalidTopology(_))));
    }

    #[test]
    fn test_connection_to_unknown_partition_rejected() {
        let mut partitions = BTreeMap::new();
        partitions.insert(PartitionId::new("p1"), BTreeSet::new());
        let connections = HashMap::from([(
            PartitionConnectionId::new(PartitionId::new("p1"), PartitionId::new("ghost")),
            PartitionConnection::blocked(),
        )]);
        let result =
            PartitionTopology::new(partitions, connections, PartitionConnection::open());
        assert!(matches!(result, Err(Error::PartitionNotFound(_))));
    }

    #[test]
    fn test_loss_out_of_range_rejected() {
        let mut partitions = BTreeMap::new();
        partitions.insert(PartitionId::new("p1"), BTreeSet::new());
        partitions.insert(PartitionId::new("p2"), BTreeSet::new());
        let connections = HashMap::from([(
            PartitionConnectionId::new(PartitionId::new("p1"), PartitionId::new("p2")),
            PartitionConnection {
                packet_loss_percentage: 250.0,
            },
        )]);
        let result =
            PartitionTopology::new(partitions, connections, PartitionConnection::open());
        assert!(matches!(result, Err(Error::InvalidTopology(_))));
    }

    #[test]
    fn test_add_to_unknown_partition_fails() {
        let mut topology = PartitionTopology::flat();
        let result = topology.add_service(ServiceId::new("a"), &PartitionId::new("ghost"));
        assert!(matches!(result, Err(Error::PartitionNotFound(_))));
    }

    #[test]
    fn test_remove_service_clears_mapping() {
        let mut topology = PartitionTopology::flat();
        topology
            .add_service(ServiceId::new("a"), &PartitionId::default_partition())
            .unwrap();
        topology.remove_service(&ServiceId::new("a"));
        assert!(topology.partition_of(&ServiceId::new("a")).is_none());
    }
}
