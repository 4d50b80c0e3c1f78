//! The persisted node table.
//!
//! A flat, line-oriented file: one line per known node plus a trailing
//! `vars` line with the epochs. Rewritten in place (write, optional fsync,
//! truncate) on every committed membership or ownership change, and held
//! under an exclusive lock for the whole process lifetime so two processes
//! can never share one table.
//!
//! ```text
//! <id> <ip>:<port> <flags> <primary|-> <ping-sent> <pong-received> <epoch> <slots...> [markers]
//! vars current_epoch <e> last_vote_epoch <e>
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::cluster::{Cluster, ClusterEvent};
use crate::config::ClusterConfig;
use crate::node::{Node, NodeId, NodeRole};
use crate::slots::SlotRange;

/// One parsed node line.
#[derive(Debug, Clone)]
pub struct TableNode {
    pub id: NodeId,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub role: NodeRole,
    pub myself: bool,
    pub fail: bool,
    pub noaddr: bool,
    pub handshake: bool,
    pub primary: Option<NodeId>,
    pub ping_sent: u64,
    pub pong_received: u64,
    pub config_epoch: u64,
    pub slots: Vec<SlotRange>,
    pub migrating: Vec<(u16, NodeId)>,
    pub importing: Vec<(u16, NodeId)>,
}

/// A fully parsed table.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    pub nodes: Vec<TableNode>,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
}

fn parse_err(line: usize, msg: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("node table line {line}: {msg}"),
    )
}

/// Parses the table format. Fails loudly: a corrupt table at startup is
/// safer as a fatal error than as silently lost membership.
pub fn parse_table(contents: &str) -> io::Result<NodeTable> {
    let mut table = NodeTable::default();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default();

        if first == "vars" {
            let mut current = None;
            let mut last_vote = None;
            while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
                match key {
                    "current_epoch" => current = value.parse().ok(),
                    "last_vote_epoch" => last_vote = value.parse().ok(),
                    _ => {}
                }
            }
            table.current_epoch =
                current.ok_or_else(|| parse_err(lineno, "vars line missing current_epoch"))?;
            table.last_vote_epoch = last_vote
                .ok_or_else(|| parse_err(lineno, "vars line missing last_vote_epoch"))?;
            continue;
        }

        let id = NodeId::parse(first).map_err(|e| parse_err(lineno, e))?;
        let addr = tokens
            .next()
            .ok_or_else(|| parse_err(lineno, "missing address"))?;
        let (ip_str, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| parse_err(lineno, "malformed address"))?;
        let ip = if ip_str.is_empty() {
            None
        } else {
            Some(
                ip_str
                    .parse::<IpAddr>()
                    .map_err(|e| parse_err(lineno, e))?,
            )
        };
        let port: u16 = port_str.parse().map_err(|e| parse_err(lineno, e))?;

        let flags_str = tokens
            .next()
            .ok_or_else(|| parse_err(lineno, "missing flags"))?;
        let mut role = NodeRole::Primary;
        let (mut myself, mut fail, mut noaddr, mut handshake) = (false, false, false, false);
        for flag in flags_str.split(',') {
            match flag {
                "primary" => role = NodeRole::Primary,
                "replica" => role = NodeRole::Replica,
                "myself" => myself = true,
                "fail" => fail = true,
                "noaddr" => noaddr = true,
                "handshake" => handshake = true,
                // private suspicions and pending meets are not durable
                "pfail" | "meet" | "-" => {}
                other => return Err(parse_err(lineno, format!("unknown flag '{other}'"))),
            }
        }

        let primary_str = tokens
            .next()
            .ok_or_else(|| parse_err(lineno, "missing primary"))?;
        let primary = if primary_str == "-" {
            None
        } else {
            Some(NodeId::parse(primary_str).map_err(|e| parse_err(lineno, e))?)
        };

        let ping_sent: u64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| parse_err(lineno, "missing ping-sent"))?;
        let pong_received: u64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| parse_err(lineno, "missing pong-received"))?;
        let config_epoch: u64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| parse_err(lineno, "missing config epoch"))?;

        let mut slots = Vec::new();
        let mut migrating = Vec::new();
        let mut importing = Vec::new();
        for token in tokens {
            if let Some(marker) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                if let Some((slot, dest)) = marker.split_once("->-") {
                    let slot = slot.parse().map_err(|e| parse_err(lineno, e))?;
                    let dest = NodeId::parse(dest).map_err(|e| parse_err(lineno, e))?;
                    migrating.push((slot, dest));
                } else if let Some((slot, src)) = marker.split_once("-<-") {
                    let slot = slot.parse().map_err(|e| parse_err(lineno, e))?;
                    let src = NodeId::parse(src).map_err(|e| parse_err(lineno, e))?;
                    importing.push((slot, src));
                } else {
                    return Err(parse_err(lineno, format!("bad marker '{token}'")));
                }
            } else {
                slots.push(token.parse().map_err(|e| parse_err(lineno, e))?);
            }
        }

        table.nodes.push(TableNode {
            id,
            ip,
            port,
            role,
            myself,
            fail,
            noaddr,
            handshake,
            primary,
            ping_sent,
            pong_received,
            config_epoch,
            slots,
            migrating,
            importing,
        });
    }
    Ok(table)
}

fn format_flags(cluster: &Cluster, node: &Node) -> String {
    let mut flags = Vec::new();
    if node.id == cluster.myself_id() {
        flags.push("myself");
    }
    flags.push(match node.role {
        NodeRole::Primary => "primary",
        NodeRole::Replica => "replica",
    });
    if node.flags.fail {
        flags.push("fail");
    } else if node.flags.pfail {
        flags.push("pfail");
    }
    if node.flags.handshake {
        flags.push("handshake");
    }
    if node.flags.noaddr {
        flags.push("noaddr");
    }
    if node.flags.meet {
        flags.push("meet");
    }
    flags.join(",")
}

/// Formats one node line; also the shape `list-peers` exposes to admins.
pub fn format_node_line(cluster: &Cluster, node: &Node) -> String {
    let ip = node.ip.map(|ip| ip.to_string()).unwrap_or_default();
    let primary = node
        .primary
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let slots = node
        .slots
        .ranges()
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let mut line = format!(
        "{} {}:{} {} {} {} {} {}",
        node.id,
        ip,
        node.port,
        format_flags(cluster, node),
        primary,
        node.ping_sent,
        node.pong_received,
        node.config_epoch,
    );
    if !slots.is_empty() {
        line.push(' ');
        line.push_str(&slots);
    }
    if node.id == cluster.myself_id() {
        for (slot, dest) in cluster.migrating_intents() {
            line.push_str(&format!(" [{slot}->-{dest}]"));
        }
        for (slot, src) in cluster.importing_intents() {
            line.push_str(&format!(" [{slot}-<-{src}]"));
        }
    }
    line
}

/// Formats the whole table, nodes sorted by id for stable diffs.
pub fn format_table(cluster: &Cluster) -> String {
    let mut nodes: Vec<&Node> = cluster.nodes().collect();
    nodes.sort_by_key(|n| n.id);
    let mut out = String::new();
    for node in nodes {
        out.push_str(&format_node_line(cluster, node));
        out.push('\n');
    }
    out.push_str(&format!(
        "vars current_epoch {} last_vote_epoch {}\n",
        cluster.current_epoch(),
        cluster.last_vote_epoch()
    ));
    out
}

impl Cluster {
    pub fn last_vote_epoch(&self) -> u64 {
        self.last_vote_epoch
    }

    pub(crate) fn migrating_intents(&self) -> Vec<(u16, NodeId)> {
        let mut v: Vec<_> = self.migrating_to.iter().map(|(s, d)| (*s, *d)).collect();
        v.sort_by_key(|(s, _)| *s);
        v
    }

    pub(crate) fn importing_intents(&self) -> Vec<(u16, NodeId)> {
        let mut v: Vec<_> = self.importing_from.iter().map(|(s, d)| (*s, *d)).collect();
        v.sort_by_key(|(s, _)| *s);
        v
    }

    /// Rebuilds a cluster from a parsed table: identity from the `myself`
    /// line, peers link-less (reconnection is the next tick's job),
    /// ownership and epochs exactly as committed.
    pub fn restore(
        config: ClusterConfig,
        announce_port: u16,
        table: &NodeTable,
        events: UnboundedSender<ClusterEvent>,
    ) -> Self {
        let myself_entry = table.nodes.iter().find(|n| n.myself);
        let mut cluster = match myself_entry {
            Some(entry) => Cluster::with_identity(config, entry.id, announce_port, events),
            None => Cluster::new(config, announce_port, events),
        };
        cluster.current_epoch = table.current_epoch;
        cluster.last_vote_epoch = table.last_vote_epoch;

        for entry in &table.nodes {
            // half-finished handshakes are not worth resurrecting
            if entry.handshake {
                continue;
            }
            if entry.id == cluster.myself_id {
                let myself = cluster.myself_mut();
                myself.role = entry.role;
                myself.config_epoch = entry.config_epoch;
                continue;
            }
            let mut node = Node::new(entry.id, entry.role, entry.ip, entry.port);
            node.flags.fail = entry.fail;
            node.flags.noaddr = entry.noaddr || entry.ip.is_none();
            node.ping_sent = entry.ping_sent;
            node.pong_received = entry.pong_received;
            node.config_epoch = entry.config_epoch;
            cluster.nodes.insert(entry.id, node);
        }

        // second pass, once every node exists: primaries, slots, intents
        for entry in &table.nodes {
            if entry.handshake {
                continue;
            }
            if let Some(primary) = entry.primary {
                cluster.set_node_primary(entry.id, Some(primary));
            }
            for range in &entry.slots {
                for slot in range.iter() {
                    cluster.assign_slot(slot, Some(entry.id));
                }
            }
            if entry.myself {
                for (slot, dest) in &entry.migrating {
                    cluster.migrating_to.insert(*slot, *dest);
                }
                for (slot, src) in &entry.importing {
                    cluster.importing_from.insert(*slot, *src);
                }
            }
        }

        cluster.pending.clear();
        cluster.update_state();
        info!(
            nodes = cluster.known_nodes(),
            epoch = cluster.current_epoch,
            "node table restored"
        );
        cluster
    }
}

/// The on-disk table file, exclusively locked for the process lifetime.
pub struct NodeTableFile {
    file: File,
    path: PathBuf,
}

impl NodeTableFile {
    /// Opens (creating if needed) and exclusively locks the table.
    ///
    /// A held lock means another process is already serving this table;
    /// that is fatal at startup by design.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("node table {} is locked by another process", path.display()),
            )
        })?;
        Ok(Self { file, path })
    }

    /// Reads the current contents; `None` for a fresh, empty table.
    pub fn load(&mut self) -> io::Result<Option<String>> {
        let mut contents = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(contents))
        }
    }

    /// Rewrites the table in place: write, optional fsync, truncate.
    ///
    /// The same fd is reused so the exclusive lock never lapses.
    pub fn save(&mut self, contents: &str, fsync: bool) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.set_len(contents.len() as u64)?;
        if fsync {
            self.file.sync_all()?;
        }
        debug!(path = %self.path.display(), bytes = contents.len(), fsync, "node table saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{add_peer, cluster};
    use crate::config::ClusterConfig;
    use tokio::sync::mpsc;

    #[test]
    fn table_roundtrip_preserves_membership() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        let primary = add_peer(&mut c, 7001, NodeRole::Primary);
        let replica = add_peer(&mut c, 7002, NodeRole::Replica);
        c.set_node_primary(replica, Some(primary));
        for slot in 0..100 {
            c.assign_slot(slot, Some(me));
        }
        for slot in 100..200 {
            c.assign_slot(slot, Some(primary));
        }
        c.migrating_to.insert(5, primary);
        c.importing_from.insert(150, primary);
        c.current_epoch = 9;
        c.last_vote_epoch = 7;
        c.nodes.get_mut(&primary).unwrap().config_epoch = 4;

        let formatted = format_table(&c);
        let parsed = parse_table(&formatted).unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        let restored = Cluster::restore(ClusterConfig::default(), 7000, &parsed, tx);

        assert_eq!(restored.myself_id(), me);
        assert_eq!(restored.current_epoch(), 9);
        assert_eq!(restored.last_vote_epoch(), 7);
        assert_eq!(restored.known_nodes(), 3);
        assert_eq!(restored.slot_owner(0), Some(me));
        assert_eq!(restored.slot_owner(150), Some(primary));
        assert_eq!(restored.slot_owner(200), None);
        assert_eq!(restored.node(&primary).unwrap().config_epoch, 4);
        assert_eq!(restored.node(&replica).unwrap().primary, Some(primary));
        assert!(restored.node(&primary).unwrap().replicas.contains(&replica));
        assert_eq!(restored.migrating_to.get(&5), Some(&primary));
        assert_eq!(restored.importing_from.get(&150), Some(&primary));
    }

    #[test]
    fn handshake_nodes_not_restored() {
        let (mut c, _rx) = cluster(7000);
        let hs = Node::handshake("10.0.0.5".parse().unwrap(), 7009);
        c.add_node(hs).unwrap();

        let parsed = parse_table(&format_table(&c)).unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        let restored = Cluster::restore(ClusterConfig::default(), 7000, &parsed, tx);
        assert_eq!(restored.known_nodes(), 1);
    }

    #[test]
    fn corrupt_table_is_an_error() {
        assert!(parse_table("not a node line\n").is_err());
        assert!(parse_table("vars current_epoch x last_vote_epoch 0\n").is_err());

        let (c, _rx) = cluster(7000);
        let mut mangled = format_table(&c);
        mangled.push_str("deadbeef 127.0.0.1:7001 primary\n"); // too few fields
        assert!(parse_table(&mangled).is_err());
    }

    #[test]
    fn empty_address_means_unknown() {
        let id = NodeId::random();
        let contents = format!(
            "{id} :7001 primary,noaddr - 0 0 0\nvars current_epoch 0 last_vote_epoch 0\n"
        );
        let parsed = parse_table(&contents).unwrap();
        assert_eq!(parsed.nodes[0].ip, None);
        assert!(parsed.nodes[0].noaddr);
    }

    #[test]
    fn table_file_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tbl");

        let mut file = NodeTableFile::open(&path).unwrap();
        assert_eq!(file.load().unwrap(), None);

        file.save("line one\n", false).unwrap();
        file.save("x\n", true).unwrap(); // shrink must truncate
        assert_eq!(file.load().unwrap(), Some("x\n".to_string()));
    }

    #[test]
    fn table_file_is_exclusively_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tbl");
        let _held = NodeTableFile::open(&path).unwrap();
        assert!(NodeTableFile::open(&path).is_err());
    }
}
