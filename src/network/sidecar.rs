//! Traffic-shaping sidecars.
//!
//! A sidecar shares its service's network namespace and maintains two
//! packet-filter chains. At any moment one chain is live (hooked into the
//! intrinsic ingress/egress chains); the other is scratch. An update flushes
//! and rebuilds the scratch chain, then repoints both hooks at it in one
//! rule replacement, so there is never a window in which the service runs
//! with empty rules.

use crate::backend::{ContainerBackend, SidecarHandle};
use crate::constants::{FILTER_CHAIN_1, FILTER_CHAIN_2};
use crate::enclave::EnclaveId;
use crate::error::{Error, Result};
use crate::service::{ServiceGuid, ServiceId};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One of the sidecar's two filter chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterChain {
    One,
    Two,
}

impl FilterChain {
    fn name(self) -> &'static str {
        match self {
            FilterChain::One => FILTER_CHAIN_1,
            FilterChain::Two => FILTER_CHAIN_2,
        }
    }

    fn other(self) -> Self {
        match self {
            FilterChain::One => FilterChain::Two,
            FilterChain::Two => FilterChain::One,
        }
    }
}

/// Handle for manipulating one service's packet filters via its sidecar.
pub struct Sidecar {
    service_id: ServiceId,
    service_guid: ServiceGuid,
    enclave_id: EnclaveId,
    handle: SidecarHandle,
    backend: Arc<dyn ContainerBackend>,
    /// Which chain is live. `None` until `initialize` has run.
    chain_in_use: Mutex<Option<FilterChain>>,
}

impl Sidecar {
    pub(crate) fn new(
        service_id: ServiceId,
        service_guid: ServiceGuid,
        enclave_id: EnclaveId,
        handle: SidecarHandle,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            service_id,
            service_guid,
            enclave_id,
            handle,
            backend,
            chain_in_use: Mutex::new(None),
        }
    }

    /// The service this sidecar is attached to.
    #[must_use]
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    #[must_use]
    pub fn service_guid(&self) -> &ServiceGuid {
        &self.service_guid
    }

    /// Creates both chains and hooks chain 1 into ingress and egress.
    /// Idempotent: a second call is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut chain_in_use = self.chain_in_use.lock().await;
        if chain_in_use.is_some() {
            return Ok(());
        }

        let command = init_command();
        debug!(service = %self.service_id, %command, "initializing sidecar filter chains");
        self.run(&command).await?;
        *chain_in_use = Some(FilterChain::One);
        info!(service = %self.service_id, "sidecar filter chains initialized");
        Ok(())
    }

    /// Rebuilds the scratch chain with drop rules for `blocked_ips`, then
    /// atomically swaps it live.
    pub async fn update_blocked_ips(&self, blocked_ips: &BTreeSet<Ipv4Addr>) -> Result<()> {
        let mut chain_in_use = self.chain_in_use.lock().await;
        let live = chain_in_use.ok_or_else(|| Error::SidecarFailed {
            service: self.service_id.to_string(),
            reason: "filter chains have not been initialized".to_string(),
        })?;
        let background = live.other();

        let command = update_command(background, blocked_ips);
        debug!(service = %self.service_id, %command, "updating sidecar filter chains");
        self.run(&command).await?;
        *chain_in_use = Some(background);
        info!(
            service = %self.service_id,
            blocked = blocked_ips.len(),
            "sidecar filter rules updated"
        );
        Ok(())
    }

    async fn run(&self, shell_command: &str) -> Result<()> {
        let output = self
            .backend
            .exec_in_sidecar(&self.enclave_id, &self.handle, shell_command)
            .await?;
        if output.exit_code != 0 {
            return Err(Error::SidecarFailed {
                service: self.service_id.to_string(),
                reason: format!(
                    "filter command exited with {}: {}",
                    output.exit_code,
                    output.output.trim()
                ),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Command generation
// =============================================================================

/// Creates both chains and inserts the first one at the head of the
/// intrinsic INPUT and OUTPUT chains.
fn init_command() -> String {
    format!(
        "iptables -N {c1} && iptables -N {c2} && \
         iptables -I INPUT 1 -j {c1} && iptables -I OUTPUT 1 -j {c1}",
        c1 = FILTER_CHAIN_1,
        c2 = FILTER_CHAIN_2,
    )
}

/// Flushes the background chain, appends drop rules for the blocked IPs on
/// both directions, then repoints the intrinsic hooks at the background
/// chain. The repoint is a rule replacement, not a flush-and-insert.
fn update_command(background: FilterChain, blocked_ips: &BTreeSet<Ipv4Addr>) -> String {
    let chain = background.name();
    let mut command = format!("iptables -F {chain}");

    if !blocked_ips.is_empty() {
        let ip_list = blocked_ips
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(",");
        // Both source and destination rules, to drop traffic in and out.
        for direction_flag in ["-s", "-d"] {
            command.push_str(&format!(
                " && iptables -A {chain} {direction_flag} {ip_list} -j DROP"
            ));
        }
    }

    for intrinsic in ["INPUT", "OUTPUT"] {
        command.push_str(&format!(" && iptables -R {intrinsic} 1 -j {chain}"));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_command_hooks_chain_one() {
        let command = init_command();
        assert!(command.contains("iptables -N ENCLAVERUN1"));
        assert!(command.contains("iptables -N ENCLAVERUN2"));
        assert!(command.contains("iptables -I INPUT 1 -j ENCLAVERUN1"));
        assert!(command.contains("iptables -I OUTPUT 1 -j ENCLAVERUN1"));
    }

    #[test]
    fn test_update_command_flushes_then_swaps() {
        let blocked = BTreeSet::from([
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 5),
        ]);
        let command = update_command(FilterChain::Two, &blocked);

        let flush_pos = command.find("iptables -F ENCLAVERUN2").unwrap();
        let drop_src_pos = command
            .find("iptables -A ENCLAVERUN2 -s 10.0.0.3,10.0.0.5 -j DROP")
            .unwrap();
        let drop_dst_pos = command
            .find("iptables -A ENCLAVERUN2 -d 10.0.0.3,10.0.0.5 -j DROP")
            .unwrap();
        let swap_in_pos = command.find("iptables -R INPUT 1 -j ENCLAVERUN2").unwrap();
        let swap_out_pos = command.find("iptables -R OUTPUT 1 -j ENCLAVERUN2").unwrap();

        // Rebuild happens strictly before the hooks swap over.
        assert!(flush_pos < drop_src_pos);
        assert!(drop_src_pos < drop_dst_pos);
        assert!(drop_dst_pos < swap_in_pos);
        assert!(swap_in_pos < swap_out_pos);
    }

    #[test]
    fn test_update_command_with_no_blocked_ips() {
        let command = update_command(FilterChain::One, &BTreeSet::new());
        assert!(command.contains("iptables -F ENCLAVERUN1"));
        assert!(!command.contains("DROP"));
        assert!(command.contains("iptables -R INPUT 1 -j ENCLAVERUN1"));
    }

    #[test]
    fn test_chain_alternation() {
        assert_eq!(FilterChain::One.other(), FilterChain::Two);
        assert_eq!(FilterChain::Two.other(), FilterChain::One);
    }
}
