//! Error types for cluster operations.

use std::net::SocketAddr;

use crate::node::NodeId;

/// Errors surfaced to the admin interface and the command router.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The slot is not assigned to any node.
    #[error("slot {0} is not assigned to any node")]
    SlotNotAssigned(u16),

    /// The keys belong to a slot owned by a different node.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: SocketAddr },

    /// The slot is being migrated; the client should retry once at `addr`.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: SocketAddr },

    /// Node not found in the registry.
    #[error("unknown node {0}")]
    NodeNotFound(NodeId),

    /// A node with this id already exists.
    #[error("node {0} already known")]
    DuplicateNode(NodeId),

    /// The cluster verdict is FAIL; traffic is not being served.
    #[error("cluster is down")]
    ClusterDown,

    /// Operation requires a different node role.
    #[error("operation not valid for a {role} node")]
    WrongRole { role: String },

    /// Keys in one command hash to different slots.
    #[error("cross-slot keys not allowed (keys span slots {0} and {1})")]
    CrossSlot(u16, u16),

    /// Admin request was malformed or violates an invariant.
    #[error("{0}")]
    AdminMisuse(String),

    /// Failure persisting the node table.
    #[error("node table persistence failed: {0}")]
    Persistence(#[from] std::io::Error),
}

impl ClusterError {
    /// Returns true if this is a redirect (MOVED or ASK).
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClusterError::Moved { .. } | ClusterError::Ask { .. })
    }
}
