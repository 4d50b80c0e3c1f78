//! Command routing for the (external) dispatcher.
//!
//! Given a command's keys, decides between serving locally, a permanent
//! MOVED redirect, or a one-shot ASK redirect during an in-flight slot
//! migration. The dispatcher supplies the two facts only it can know:
//! whether any of the keys are missing locally, and whether the client
//! prefixed the command with an ASKING exemption.

use std::net::SocketAddr;

use serde::Serialize;

use crate::cluster::Cluster;
use crate::error::ClusterError;
use crate::health::ClusterVerdict;
use crate::node::NodeId;
use crate::slots::key_slot;

/// The routing decision for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RouteDecision {
    /// Serve from the local storage engine.
    Local,
    /// The slot permanently lives elsewhere.
    Moved { slot: u16, addr: SocketAddr },
    /// The slot is mid-migration; retry this one command at `addr` with an
    /// ASKING exemption, then come back here.
    Ask { slot: u16, addr: SocketAddr },
}

impl RouteDecision {
    /// The client-facing redirect error for this decision, if any. The
    /// dispatcher sends its `Display` form (`MOVED <slot> <addr>` /
    /// `ASK <slot> <addr>`) verbatim.
    pub fn redirect_error(&self) -> Option<ClusterError> {
        match self {
            RouteDecision::Local => None,
            RouteDecision::Moved { slot, addr } => Some(ClusterError::Moved {
                slot: *slot,
                addr: *addr,
            }),
            RouteDecision::Ask { slot, addr } => Some(ClusterError::Ask {
                slot: *slot,
                addr: *addr,
            }),
        }
    }
}

impl Cluster {
    /// Routes a command over `keys`.
    ///
    /// `missing_keys` reports whether any addressed key is absent from the
    /// local store; `asking` reports the client's one-shot exemption for an
    /// importing slot.
    pub fn route(
        &self,
        keys: &[&[u8]],
        missing_keys: bool,
        asking: bool,
    ) -> Result<RouteDecision, ClusterError> {
        // keyless commands always run locally
        let Some(first) = keys.first() else {
            return Ok(RouteDecision::Local);
        };

        let slot = key_slot(first);
        for key in &keys[1..] {
            let other = key_slot(key);
            if other != slot {
                return Err(ClusterError::CrossSlot(slot, other));
            }
        }

        if self.verdict() != ClusterVerdict::Ok {
            return Err(ClusterError::ClusterDown);
        }

        let Some(owner) = self.slot_owner(slot) else {
            return Err(ClusterError::SlotNotAssigned(slot));
        };

        // replicas route on behalf of their primary
        let serving_here = owner == self.my_primary_id() || owner == self.myself_id();

        if serving_here {
            if missing_keys {
                // mid-migration, keys already moved: hand the client a
                // one-shot retry at the declared destination
                if let Some(dest) = self.migrating_to.get(&slot) {
                    let addr = self.node_addr(*dest)?;
                    return Ok(RouteDecision::Ask { slot, addr });
                }
            }
            return Ok(RouteDecision::Local);
        }

        // the importing side accepts keys for a not-yet-owned slot, but
        // only under the client's explicit ASKING exemption
        if asking && self.importing_from.contains_key(&slot) {
            return Ok(RouteDecision::Local);
        }

        let addr = self.node_addr(owner)?;
        Ok(RouteDecision::Moved { slot, addr })
    }

    fn node_addr(&self, id: NodeId) -> Result<SocketAddr, ClusterError> {
        let node = self.node(&id).ok_or(ClusterError::NodeNotFound(id))?;
        let ip = node.ip.ok_or(ClusterError::ClusterDown)?;
        Ok(SocketAddr::new(ip, node.port))
    }
}
