//! keel-cluster: membership and coordination for a sharded, replicated
//! key-value cluster.
//!
//! This crate is the distributed-systems core of keel: an
//! eventually-consistent gossip protocol, a quorum-based failure detector,
//! a voting protocol for primary failover, and admin-driven live slot
//! migration, all over a custom binary wire format.
//!
//! # Architecture
//!
//! Everything hangs off one explicit [`Cluster`] context owned by the host
//! event loop:
//!
//! - **Node registry**: the arena of known peers, keyed by 40-hex-char
//!   [`NodeId`], plus a TTL'd blacklist of forgotten nodes
//! - **Wire codec**: fixed binary header + typed payloads ([`Message`])
//! - **Gossip engine**: periodic probing and heartbeat fact exchange
//! - **Failure detector**: pfail/fail promotion under primary quorum
//! - **Slot map**: the 16384-way partition table with migration intents
//! - **Failover coordinator**: rank-delayed elections, manual handovers
//! - **State evaluator**: the OK/FAIL verdict gating client traffic
//!
//! The core performs no I/O. Ticks and message handlers return the
//! connects and sends the host should perform, which keeps whole-cluster
//! scenarios simulatable in plain unit tests:
//!
//! ```rust,ignore
//! use keel_cluster::{Cluster, ClusterConfig};
//! use tokio::sync::mpsc;
//!
//! let (events, _rx) = mpsc::unbounded_channel();
//! let mut cluster = Cluster::new(ClusterConfig::default(), 7000, events);
//! let actions = cluster.tick();
//! // dial actions.connects, transmit actions.sends ...
//! ```

mod admin;
mod cluster;
mod config;
mod error;
mod failover;
mod failure;
mod gossip;
mod health;
mod link;
mod message;
mod node;
mod persistence;
mod rebalance;
mod routing;
mod slots;
mod time;

pub use admin::{AdminReply, AdminRequest, ClusterInfo};
pub use cluster::{
    Cluster, ClusterEvent, ConnectRequest, DeferredAction, Destination, MessageStats, Outbound,
    TableSave, TickActions,
};
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use failover::{FailoverPhase, FailoverState, ManualFailoverState};
pub use gossip::HandleOutcome;
pub use health::ClusterVerdict;
pub use link::LinkDecoder;
pub use message::{
    GossipFact, Header, Message, MessageFlags, MessageKind, Payload, FACT_SIZE, HEADER_SIZE,
    KIND_COUNT, MAX_MESSAGE_SIZE, PROTOCOL_VERSION, SIGNATURE,
};
pub use node::{Blacklist, FailReport, LinkId, Node, NodeFlags, NodeId, NodeRole, NODE_ID_LEN};
pub use persistence::{
    format_node_line, format_table, parse_table, NodeTable, NodeTableFile, TableNode,
};
pub use routing::RouteDecision;
pub use slots::{key_slot, SlotBitmap, SlotRange, SLOT_BITMAP_BYTES, SLOT_COUNT};
pub use time::now_ms;
