//! Node identity and per-peer state.
//!
//! Nodes live in an arena keyed by [`NodeId`]; all cross-references
//! (primary, replicas, slot ownership) are ids, never pointers, so removing
//! a node is a map delete plus an id sweep.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::slots::SlotBitmap;
use crate::time::now_ms;

/// Length of a node id: 40 lowercase hex characters.
pub const NODE_ID_LEN: usize = 40;

/// Fixed-length hex identifier, unique across the cluster for the lifetime
/// of a node. Assigned randomly at first contact and never reused; byte
/// order doubles as the lexicographic tie-break order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        use rand::Rng;
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut rng = rand::rng();
        let mut id = [0u8; NODE_ID_LEN];
        for byte in &mut id {
            *byte = HEX[rng.random_range(0..16)];
        }
        Self(id)
    }

    /// Parses a 40-character hex string.
    pub fn parse(s: &str) -> Result<Self, String> {
        let bytes = s.as_bytes();
        if bytes.len() != NODE_ID_LEN {
            return Err(format!(
                "node id must be {NODE_ID_LEN} hex characters, got {}",
                bytes.len()
            ));
        }
        if !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("node id '{s}' contains non-hex characters"));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Builds an id from raw wire bytes; all-zero means "none".
    pub fn from_wire(bytes: &[u8; NODE_ID_LEN]) -> Option<Self> {
        if bytes.iter().all(|&b| b == 0) {
            None
        } else {
            Some(Self(*bytes))
        }
    }

    pub fn as_str(&self) -> &str {
        // ids only ever hold ascii hex
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // first 8 chars, like a short git hash
        write!(f, "NodeId({})", &self.as_str()[..8])
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque handle for a peer link, allocated by the host event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Owns slots and accepts writes.
    Primary,
    /// Mirrors a primary's data; owns no slots.
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// Liveness and lifecycle flags for a node, from the local observer's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Privately suspected unreachable (local timeout fired).
    pub pfail: bool,
    /// Confirmed unreachable by a quorum of primaries.
    pub fail: bool,
    /// Handshake in progress; identity not yet confirmed.
    pub handshake: bool,
    /// Address unknown; must be rediscovered through gossip.
    pub noaddr: bool,
    /// A meet heartbeat is owed to (or awaiting acknowledgment from) this node.
    pub meet: bool,
}

// Wire bit assignments for the 2-byte flags field.
const WIRE_PRIMARY: u16 = 1 << 0;
const WIRE_REPLICA: u16 = 1 << 1;
const WIRE_PFAIL: u16 = 1 << 2;
const WIRE_FAIL: u16 = 1 << 3;
const WIRE_MYSELF: u16 = 1 << 4;
const WIRE_HANDSHAKE: u16 = 1 << 5;
const WIRE_NOADDR: u16 = 1 << 6;
const WIRE_MEET: u16 = 1 << 7;

impl NodeFlags {
    /// Encodes role + flags into the wire representation.
    pub fn to_wire(self, role: NodeRole, myself: bool) -> u16 {
        let mut bits = match role {
            NodeRole::Primary => WIRE_PRIMARY,
            NodeRole::Replica => WIRE_REPLICA,
        };
        if self.pfail {
            bits |= WIRE_PFAIL;
        }
        if self.fail {
            bits |= WIRE_FAIL;
        }
        if myself {
            bits |= WIRE_MYSELF;
        }
        if self.handshake {
            bits |= WIRE_HANDSHAKE;
        }
        if self.noaddr {
            bits |= WIRE_NOADDR;
        }
        if self.meet {
            bits |= WIRE_MEET;
        }
        bits
    }

    /// Decodes a wire flags field into (role, flags).
    pub fn from_wire(bits: u16) -> (NodeRole, Self) {
        let role = if bits & WIRE_REPLICA != 0 {
            NodeRole::Replica
        } else {
            NodeRole::Primary
        };
        (
            role,
            Self {
                pfail: bits & WIRE_PFAIL != 0,
                fail: bits & WIRE_FAIL != 0,
                handshake: bits & WIRE_HANDSHAKE != 0,
                noaddr: bits & WIRE_NOADDR != 0,
                meet: bits & WIRE_MEET != 0,
            },
        )
    }
}

/// A peer's claim that a node is unreachable, with the time it was last
/// renewed. Reports expire so a long-recovered node stops weighing toward
/// quorum decisions.
#[derive(Debug, Clone, Copy)]
pub struct FailReport {
    pub reporter: NodeId,
    pub time_ms: u64,
}

/// Everything the local node knows about one peer (or about itself).
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// `None` while the address is unknown (noaddr).
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    /// Slots owned; always empty for replicas.
    pub slots: SlotBitmap,
    /// Epoch of this node's slot configuration; higher wins conflicts.
    pub config_epoch: u64,
    /// Set iff this node is a replica.
    pub primary: Option<NodeId>,
    /// Ids of replicas whose `primary` points back at this node.
    pub replicas: Vec<NodeId>,
    /// Outbound link toward this peer, if we initiated one.
    pub link: Option<LinkId>,
    pub created_ms: u64,
    /// When the last heartbeat was sent and not yet answered (0 = none
    /// outstanding).
    pub ping_sent: u64,
    /// When the last heartbeat reply arrived.
    pub pong_received: u64,
    /// When the fail flag was set.
    pub fail_time: u64,
    /// Last time we granted an election vote to a replica of this primary.
    pub voted_time: u64,
    /// Replication offset last announced by this node.
    pub repl_offset: u64,
    pub fail_reports: Vec<FailReport>,
}

impl Node {
    /// Creates a node record with the given id, role and optional address.
    pub fn new(id: NodeId, role: NodeRole, ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            id,
            ip,
            port,
            role,
            flags: NodeFlags::default(),
            slots: SlotBitmap::new(),
            config_epoch: 0,
            primary: None,
            replicas: Vec::new(),
            link: None,
            created_ms: now_ms(),
            ping_sent: 0,
            pong_received: 0,
            fail_time: 0,
            voted_time: 0,
            repl_offset: 0,
            fail_reports: Vec::new(),
        }
    }

    /// Creates a placeholder in handshake state, as used for nodes learned
    /// through gossip or MEET before their identity is confirmed.
    pub fn handshake(ip: IpAddr, port: u16) -> Self {
        let mut node = Self::new(NodeId::random(), NodeRole::Primary, Some(ip), port);
        node.flags.handshake = true;
        node.flags.meet = true;
        node
    }

    pub fn slot_count(&self) -> usize {
        self.slots.count()
    }

    /// True when this node can be counted on: not failing and identity
    /// confirmed.
    pub fn is_working(&self) -> bool {
        !self.flags.fail && !self.flags.pfail && !self.flags.handshake
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

/// TTL'd negative cache of recently removed node ids.
///
/// Prevents a just-forgotten node from being re-learned through gossip from
/// peers that have not yet heard about the removal.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashMap<NodeId, u64>,
    ttl_ms: u64,
}

impl Blacklist {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
        }
    }

    pub fn add(&mut self, id: NodeId) {
        self.entries.insert(id, now_ms() + self.ttl_ms);
    }

    pub fn contains(&mut self, id: &NodeId) -> bool {
        let now = now_ms();
        self.entries.retain(|_, expiry| *expiry > now);
        self.entries.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_random_is_hex() {
        let id = NodeId::random();
        assert_eq!(id.as_str().len(), NODE_ID_LEN);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn node_id_parse_roundtrip() {
        let id = NodeId::random();
        assert_eq!(NodeId::parse(id.as_str()).unwrap(), id);

        assert!(NodeId::parse("short").is_err());
        assert!(NodeId::parse(&"g".repeat(NODE_ID_LEN)).is_err());
    }

    #[test]
    fn node_id_wire_none_is_all_zero() {
        assert_eq!(NodeId::from_wire(&[0u8; NODE_ID_LEN]), None);
        let id = NodeId::random();
        assert_eq!(NodeId::from_wire(&id.0), Some(id));
    }

    #[test]
    fn flags_wire_roundtrip() {
        let flags = NodeFlags {
            pfail: true,
            fail: false,
            handshake: true,
            noaddr: false,
            meet: true,
        };
        let bits = flags.to_wire(NodeRole::Replica, false);
        let (role, decoded) = NodeFlags::from_wire(bits);
        assert_eq!(role, NodeRole::Replica);
        assert_eq!(decoded, flags);
    }

    #[test]
    fn handshake_node_has_placeholder_identity() {
        let node = Node::handshake("127.0.0.1".parse().unwrap(), 7000);
        assert!(node.flags.handshake);
        assert!(node.flags.meet);
        assert!(!node.is_working());
    }

    #[test]
    fn blacklist_expires() {
        let mut bl = Blacklist::new(0);
        let id = NodeId::random();
        bl.add(id);
        // zero TTL expires immediately
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(!bl.contains(&id));

        let mut bl = Blacklist::new(60_000);
        bl.add(id);
        assert!(bl.contains(&id));
    }
}
