//! Binary wire format for the cluster bus.
//!
//! Every message starts with the same fixed header carrying the sender's
//! identity, epochs, slot ownership bitmap and liveness flags, followed by a
//! payload determined by the message type. All multi-byte integers are
//! network byte order.
//!
//! Header layout (2174 bytes):
//!
//! ```text
//! sig(4) totlen(4) ver(2) type(2) count(2) current_epoch(8) config_epoch(8)
//! repl_offset(8) sender(40) slots(2048) primary(40) port(2) flags(2)
//! verdict(1) mflags(3)
//! ```

use std::io::{self, Read};
use std::net::{IpAddr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::health::ClusterVerdict;
use crate::node::{NodeId, NODE_ID_LEN};
use crate::slots::{SlotBitmap, SLOT_BITMAP_BYTES};

/// Magic signature opening every message.
pub const SIGNATURE: [u8; 4] = *b"KeEb";

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 4 + 4 + 2 + 2 + 2 + 8 + 8 + 8 + NODE_ID_LEN
    + SLOT_BITMAP_BYTES
    + NODE_ID_LEN
    + 2
    + 2
    + 1
    + 3;

/// Size of one encoded gossip fact.
pub const FACT_SIZE: usize = NODE_ID_LEN + 4 + 4 + 16 + 2 + 2;

/// Hard ceiling on a declared message length; anything larger is garbage.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

// Safe read helpers that return io::Error instead of panicking on
// truncated input.

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16())
}

fn safe_get_u32(buf: &mut &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_u32())
}

fn safe_get_u64(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64())
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// The nine message types of the bus protocol.
///
/// Ping, Pong and Meet share the heartbeat wire shape; Meet additionally
/// tells the receiver to trust the sender enough to add it to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Pong,
    Meet,
    Fail,
    Publish,
    VoteRequest,
    VoteGrant,
    Update,
    MfStart,
}

/// Number of distinct message kinds (for stats arrays).
pub const KIND_COUNT: usize = 9;

impl MessageKind {
    pub fn as_u16(self) -> u16 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Pong => 1,
            MessageKind::Meet => 2,
            MessageKind::Fail => 3,
            MessageKind::Publish => 4,
            MessageKind::VoteRequest => 5,
            MessageKind::VoteGrant => 6,
            MessageKind::Update => 7,
            MessageKind::MfStart => 8,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => MessageKind::Ping,
            1 => MessageKind::Pong,
            2 => MessageKind::Meet,
            3 => MessageKind::Fail,
            4 => MessageKind::Publish,
            5 => MessageKind::VoteRequest,
            6 => MessageKind::VoteGrant,
            7 => MessageKind::Update,
            8 => MessageKind::MfStart,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Meet => "meet",
            MessageKind::Fail => "fail",
            MessageKind::Publish => "publish",
            MessageKind::VoteRequest => "vote-request",
            MessageKind::VoteGrant => "vote-grant",
            MessageKind::Update => "update",
            MessageKind::MfStart => "mfstart",
        }
    }

    fn is_heartbeat(self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong | MessageKind::Meet)
    }
}

/// Per-message flag bits (first byte of the 3-byte mflags field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags {
    /// Sender is a primary with writes paused for a manual failover.
    pub paused: bool,
    /// Vote request should be honored even though the primary is not
    /// confirmed down (manual failover).
    pub force_ack: bool,
}

impl MessageFlags {
    fn to_wire(self) -> [u8; 3] {
        let mut b0 = 0u8;
        if self.paused {
            b0 |= 1;
        }
        if self.force_ack {
            b0 |= 2;
        }
        [b0, 0, 0]
    }

    fn from_wire(bytes: [u8; 3]) -> Self {
        Self {
            paused: bytes[0] & 1 != 0,
            force_ack: bytes[0] & 2 != 0,
        }
    }
}

/// A compact status snippet about a third node, embedded in heartbeats.
///
/// Never describes the sender itself; the sender's own status travels in
/// the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipFact {
    pub id: NodeId,
    /// When the sender last pinged this node (unix seconds, 0 = none
    /// outstanding).
    pub ping_sent: u32,
    /// When the sender last heard a reply (unix seconds).
    pub pong_received: u32,
    pub ip: IpAddr,
    pub port: u16,
    /// Wire-encoded role + liveness flags, as seen by the sender.
    pub flags: u16,
}

/// The fixed per-message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    /// Sender's view of the cluster-wide epoch.
    pub current_epoch: u64,
    /// Config epoch of the sender (or of its primary, for replicas).
    pub config_epoch: u64,
    /// Sender's replication offset.
    pub repl_offset: u64,
    pub sender: NodeId,
    /// Slots the sender claims to own (empty for replicas).
    pub slots: SlotBitmap,
    /// The sender's primary, or `None` if the sender is itself a primary.
    pub primary: Option<NodeId>,
    /// Port the sender's bus listens on; the ip is taken from the link.
    pub port: u16,
    /// Sender's wire-encoded role + flags.
    pub flags: u16,
    pub verdict: ClusterVerdict,
    pub mflags: MessageFlags,
}

/// Type-specific message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Ping / Pong / Meet: up to a handful of third-party facts.
    Heartbeat(Vec<GossipFact>),
    /// Quorum-backed assertion that a node is down.
    Fail { node: NodeId },
    /// Cluster-wide pub/sub relay.
    Publish { channel: Bytes, payload: Bytes },
    /// Slot ownership snapshot for one node, pushed at peers with stale
    /// information.
    Update {
        node: NodeId,
        config_epoch: u64,
        slots: SlotBitmap,
    },
    /// Vote request/grant and manual failover start carry no body.
    Empty,
}

/// A complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    /// Serializes the message, computing the total length field.
    pub fn encode(&self) -> Bytes {
        let facts = match &self.payload {
            Payload::Heartbeat(facts) => facts.len(),
            _ => 0,
        };
        let body_len = match &self.payload {
            Payload::Heartbeat(facts) => facts.len() * FACT_SIZE,
            Payload::Fail { .. } => NODE_ID_LEN,
            Payload::Publish { channel, payload } => 8 + channel.len() + payload.len(),
            Payload::Update { .. } => NODE_ID_LEN + 8 + SLOT_BITMAP_BYTES,
            Payload::Empty => 0,
        };
        let total = HEADER_SIZE + body_len;
        let mut buf = BytesMut::with_capacity(total);

        let h = &self.header;
        buf.put_slice(&SIGNATURE);
        buf.put_u32(total as u32);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(h.kind.as_u16());
        buf.put_u16(facts as u16);
        buf.put_u64(h.current_epoch);
        buf.put_u64(h.config_epoch);
        buf.put_u64(h.repl_offset);
        buf.put_slice(&h.sender.0);
        buf.put_slice(h.slots.as_bytes());
        match h.primary {
            Some(primary) => buf.put_slice(&primary.0),
            None => buf.put_slice(&[0u8; NODE_ID_LEN]),
        }
        buf.put_u16(h.port);
        buf.put_u16(h.flags);
        buf.put_u8(h.verdict.as_u8());
        buf.put_slice(&h.mflags.to_wire());

        match &self.payload {
            Payload::Heartbeat(facts) => {
                for fact in facts {
                    encode_fact(&mut buf, fact);
                }
            }
            Payload::Fail { node } => buf.put_slice(&node.0),
            Payload::Publish { channel, payload } => {
                buf.put_u32(channel.len() as u32);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(channel);
                buf.put_slice(payload);
            }
            Payload::Update {
                node,
                config_epoch,
                slots,
            } => {
                buf.put_slice(&node.0);
                buf.put_u64(*config_epoch);
                buf.put_slice(slots.as_bytes());
            }
            Payload::Empty => {}
        }

        debug_assert_eq!(buf.len(), total);
        buf.freeze()
    }

    /// Deserializes a complete message.
    ///
    /// The caller must pass exactly the bytes of one message; any signature,
    /// version, type or length mismatch is an error and the message should
    /// be dropped without touching the link.
    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(invalid("message shorter than header"));
        }
        let mut buf = bytes;

        let mut sig = [0u8; 4];
        buf.read_exact(&mut sig)?;
        if sig != SIGNATURE {
            return Err(invalid("bad signature"));
        }
        let total = safe_get_u32(&mut buf)? as usize;
        if total != bytes.len() {
            return Err(invalid(format!(
                "declared length {total} does not match {} received bytes",
                bytes.len()
            )));
        }
        let version = safe_get_u16(&mut buf)?;
        if version != PROTOCOL_VERSION {
            return Err(invalid(format!("unsupported protocol version {version}")));
        }
        let kind = MessageKind::from_u16(safe_get_u16(&mut buf)?)
            .ok_or_else(|| invalid("unknown message type"))?;
        let count = safe_get_u16(&mut buf)? as usize;

        let current_epoch = safe_get_u64(&mut buf)?;
        let config_epoch = safe_get_u64(&mut buf)?;
        let repl_offset = safe_get_u64(&mut buf)?;
        let sender = decode_node_id(&mut buf)?
            .ok_or_else(|| invalid("message with all-zero sender id"))?;
        let slots = decode_bitmap(&mut buf)?;
        let primary = decode_node_id(&mut buf)?;
        let port = safe_get_u16(&mut buf)?;
        let flags = safe_get_u16(&mut buf)?;
        let verdict = ClusterVerdict::from_u8(safe_get_u8(&mut buf)?)
            .ok_or_else(|| invalid("bad cluster verdict byte"))?;
        let mut mflag_bytes = [0u8; 3];
        buf.read_exact(&mut mflag_bytes)?;
        let mflags = MessageFlags::from_wire(mflag_bytes);

        let body_len = total - HEADER_SIZE;
        let payload = match kind {
            MessageKind::Ping | MessageKind::Pong | MessageKind::Meet => {
                if body_len != count * FACT_SIZE {
                    return Err(invalid(format!(
                        "heartbeat declares {count} facts but carries {body_len} body bytes"
                    )));
                }
                let mut facts = Vec::with_capacity(count);
                for _ in 0..count {
                    facts.push(decode_fact(&mut buf)?);
                }
                Payload::Heartbeat(facts)
            }
            MessageKind::Fail => {
                if body_len != NODE_ID_LEN {
                    return Err(invalid("fail body must be one node id"));
                }
                let node = decode_node_id(&mut buf)?
                    .ok_or_else(|| invalid("fail assertion with all-zero node id"))?;
                Payload::Fail { node }
            }
            MessageKind::Publish => {
                let channel_len = safe_get_u32(&mut buf)? as usize;
                let payload_len = safe_get_u32(&mut buf)? as usize;
                if body_len != 8 + channel_len + payload_len {
                    return Err(invalid("publish body length mismatch"));
                }
                let channel = Bytes::copy_from_slice(&buf[..channel_len]);
                buf.advance(channel_len);
                let payload = Bytes::copy_from_slice(&buf[..payload_len]);
                buf.advance(payload_len);
                Payload::Publish { channel, payload }
            }
            MessageKind::Update => {
                if body_len != NODE_ID_LEN + 8 + SLOT_BITMAP_BYTES {
                    return Err(invalid("update body length mismatch"));
                }
                let node = decode_node_id(&mut buf)?
                    .ok_or_else(|| invalid("update with all-zero node id"))?;
                let config_epoch = safe_get_u64(&mut buf)?;
                let slots = decode_bitmap(&mut buf)?;
                Payload::Update {
                    node,
                    config_epoch,
                    slots,
                }
            }
            MessageKind::VoteRequest | MessageKind::VoteGrant | MessageKind::MfStart => {
                if body_len != 0 {
                    return Err(invalid(format!(
                        "{} message must have an empty body",
                        kind.name()
                    )));
                }
                Payload::Empty
            }
        };

        if !kind.is_heartbeat() && count != 0 {
            return Err(invalid("non-heartbeat message with non-zero fact count"));
        }

        Ok(Message {
            header: Header {
                kind,
                current_epoch,
                config_epoch,
                repl_offset,
                sender,
                slots,
                primary,
                port,
                flags,
                verdict,
                mflags,
            },
            payload,
        })
    }
}

fn decode_node_id(buf: &mut &[u8]) -> io::Result<Option<NodeId>> {
    if buf.len() < NODE_ID_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for node id",
        ));
    }
    let mut bytes = [0u8; NODE_ID_LEN];
    buf.read_exact(&mut bytes)?;
    Ok(NodeId::from_wire(&bytes))
}

fn decode_bitmap(buf: &mut &[u8]) -> io::Result<SlotBitmap> {
    if buf.len() < SLOT_BITMAP_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for slot bitmap",
        ));
    }
    let bitmap = SlotBitmap::from_bytes(&buf[..SLOT_BITMAP_BYTES])
        .ok_or_else(|| invalid("bad slot bitmap"))?;
    buf.advance(SLOT_BITMAP_BYTES);
    Ok(bitmap)
}

fn encode_ip(buf: &mut BytesMut, ip: &IpAddr) {
    // v4 addresses travel as v4-mapped v6 octets so the field is fixed-size
    let octets = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    };
    buf.put_slice(&octets);
}

fn decode_ip(buf: &mut &[u8]) -> io::Result<IpAddr> {
    if buf.len() < 16 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for ip",
        ));
    }
    let mut octets = [0u8; 16];
    buf.read_exact(&mut octets)?;
    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

fn encode_fact(buf: &mut BytesMut, fact: &GossipFact) {
    buf.put_slice(&fact.id.0);
    buf.put_u32(fact.ping_sent);
    buf.put_u32(fact.pong_received);
    encode_ip(buf, &fact.ip);
    buf.put_u16(fact.port);
    buf.put_u16(fact.flags);
}

fn decode_fact(buf: &mut &[u8]) -> io::Result<GossipFact> {
    let id = decode_node_id(buf)?.ok_or_else(|| invalid("gossip fact with all-zero id"))?;
    let ping_sent = safe_get_u32(buf)?;
    let pong_received = safe_get_u32(buf)?;
    let ip = decode_ip(buf)?;
    let port = safe_get_u16(buf)?;
    let flags = safe_get_u16(buf)?;
    Ok(GossipFact {
        id,
        ping_sent,
        pong_received,
        ip,
        port,
        flags,
    })
}
