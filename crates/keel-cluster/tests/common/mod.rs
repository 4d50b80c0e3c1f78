//! In-memory multi-node simulation harness.
//!
//! Runs several `Cluster` instances against each other by shuttling their
//! outbound messages directly, with no sockets: connect requests become
//! link pairs, sends become `handle_message` calls on the peer. Killing a
//! node silently drops its traffic, which is exactly what a crashed
//! process looks like from the outside.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use keel_cluster::{
    AdminReply, AdminRequest, Cluster, ClusterConfig, ClusterEvent, ConnectRequest, LinkId,
    Message, MessageKind, NodeId, Outbound,
};
use tokio::sync::mpsc::UnboundedReceiver;

const BASE_PORT: u16 = 7000;

pub fn sim_ip() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// A record of one delivered message, for protocol-level assertions.
#[allow(dead_code)]
pub struct Delivery {
    pub from: usize,
    pub to: usize,
    pub kind: MessageKind,
}

pub struct Sim {
    pub clusters: Vec<Cluster>,
    pub events: Vec<UnboundedReceiver<ClusterEvent>>,
    alive: Vec<bool>,
    /// (owner index, owner-side link) -> (peer index, peer-side link)
    conns: HashMap<(usize, LinkId), (usize, LinkId)>,
    next_link: u64,
    /// Every message actually delivered, in order.
    pub log: Vec<Delivery>,
}

impl Sim {
    /// Builds `n` isolated single-node clusters on ports 7000, 7001, ...
    pub fn new(n: usize, config: ClusterConfig) -> Self {
        let mut clusters = Vec::with_capacity(n);
        let mut events = Vec::with_capacity(n);
        for i in 0..n {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            clusters.push(Cluster::new(config.clone(), BASE_PORT + i as u16, tx));
            events.push(rx);
        }
        Self {
            clusters,
            events,
            alive: vec![true; n],
            conns: HashMap::new(),
            next_link: 1,
            log: Vec::new(),
        }
    }

    pub fn id_of(&self, i: usize) -> NodeId {
        self.clusters[i].myself_id()
    }

    fn index_of_port(&self, port: u16) -> Option<usize> {
        let i = port.checked_sub(BASE_PORT)? as usize;
        (i < self.clusters.len()).then_some(i)
    }

    /// Issues an admin request against node `i`, delivering any messages it
    /// produces.
    pub fn admin(&mut self, i: usize, request: AdminRequest) -> AdminReply {
        let (reply, sends) = self.clusters[i]
            .admin(request)
            .expect("admin request should succeed");
        let mut queue: VecDeque<(usize, Outbound)> =
            sends.into_iter().map(|s| (i, s)).collect();
        self.pump(&mut queue);
        reply
    }

    /// `i` meets `j`, like an operator running `MEET` against node `i`.
    pub fn meet(&mut self, i: usize, j: usize) {
        let port = BASE_PORT + j as u16;
        self.admin(
            i,
            AdminRequest::Meet {
                ip: sim_ip(),
                port,
            },
        );
    }

    /// Stops delivering anything to or from node `i`, as a crash would.
    #[allow(dead_code)]
    pub fn kill(&mut self, i: usize) {
        self.alive[i] = false;
    }

    /// Brings a killed node back; its next tick resumes heartbeating.
    #[allow(dead_code)]
    pub fn revive(&mut self, i: usize) {
        self.alive[i] = true;
    }

    /// Runs one tick on every live node, delivering all resulting traffic
    /// to completion.
    pub fn step(&mut self) {
        let n = self.clusters.len();
        let mut queue: VecDeque<(usize, Outbound)> = VecDeque::new();

        for i in 0..n {
            if !self.alive[i] {
                continue;
            }
            let actions = self.clusters[i].tick();
            for request in actions.connects {
                if let Some(out) = self.connect(i, request) {
                    queue.push_back((i, out));
                }
            }
            for send in actions.sends {
                queue.push_back((i, send));
            }
            self.pump(&mut queue);
        }

        for i in 0..n {
            for link in self.clusters[i].take_dead_links() {
                self.teardown(i, link);
            }
            self.clusters[i].flush_deferred();
        }
        self.assert_slot_exclusivity();
    }

    #[allow(dead_code)]
    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Runs up to `max_steps`, sleeping `sleep_ms` of real time between
    /// steps (the protocol's timers are wall-clock), until `done` holds.
    pub fn run_until(
        &mut self,
        max_steps: usize,
        sleep_ms: u64,
        mut done: impl FnMut(&Sim) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            self.step();
        }
        done(self)
    }

    /// Establishes a bidirectional link pair for an outbound dial.
    fn connect(&mut self, i: usize, request: ConnectRequest) -> Option<Outbound> {
        let j = self.index_of_port(request.addr.port())?;
        if !self.alive[j] {
            return None; // connection refused
        }
        let la = LinkId(self.next_link);
        let lb = LinkId(self.next_link + 1);
        self.next_link += 2;
        self.conns.insert((i, la), (j, lb));
        self.conns.insert((j, lb), (i, la));
        self.clusters[i].link_established(request.node, la)
    }

    fn teardown(&mut self, owner: usize, link: LinkId) {
        if let Some((peer, peer_link)) = self.conns.remove(&(owner, link)) {
            self.conns.remove(&(peer, peer_link));
            self.clusters[owner].link_closed(link);
            self.clusters[peer].link_closed(peer_link);
        }
    }

    /// Delivers queued messages (and everything they trigger) until quiet.
    fn pump(&mut self, queue: &mut VecDeque<(usize, Outbound)>) {
        while let Some((from, outbound)) = queue.pop_front() {
            if !self.alive[from] {
                continue;
            }
            let links = self.clusters[from].resolve_destination(outbound.dest);
            for link in links {
                let Some(&(to, to_link)) = self.conns.get(&(from, link)) else {
                    continue;
                };
                if !self.alive[to] {
                    continue;
                }
                self.log.push(Delivery {
                    from,
                    to,
                    kind: outbound.message.header.kind,
                });
                let message: Message = outbound.message.clone();
                let outcome = self.clusters[to].handle_message(to_link, sim_ip(), message);
                for send in outcome.sends {
                    queue.push_back((to, send));
                }
                if outcome.close_link {
                    self.teardown(to, to_link);
                }
                for dead in self.clusters[to].take_dead_links() {
                    self.teardown(to, dead);
                }
            }
        }
    }

    /// The invariant that must hold after every step: each slot maps to at
    /// most one node. Bitmap bits must agree with the table in both
    /// directions, which rules out two nodes claiming one slot.
    fn assert_slot_exclusivity(&self) {
        for (i, cluster) in self.clusters.iter().enumerate() {
            for node in cluster.nodes() {
                for slot in node.slots.iter() {
                    assert_eq!(
                        cluster.slot_owner(slot),
                        Some(node.id),
                        "node {i}: slot {slot} in {}'s bitmap but the table disagrees",
                        node.id
                    );
                }
            }
            for slot in 0..keel_cluster::SLOT_COUNT {
                if let Some(owner) = cluster.slot_owner(slot) {
                    assert!(
                        cluster
                            .node(&owner)
                            .is_some_and(|n| n.slots.contains(slot)),
                        "node {i}: table says {owner} owns slot {slot}, bitmap disagrees"
                    );
                }
            }
        }
    }

    /// True when every live node knows every other live node by real id
    /// (no handshakes pending).
    pub fn fully_meshed(&self) -> bool {
        let ids: Vec<NodeId> = (0..self.clusters.len())
            .filter(|i| self.alive[*i])
            .map(|i| self.id_of(i))
            .collect();
        self.clusters
            .iter()
            .enumerate()
            .filter(|(i, _)| self.alive[*i])
            .all(|(_, c)| {
                ids.iter().all(|id| {
                    c.node(id)
                        .map(|n| !n.flags.handshake)
                        .unwrap_or(false)
                })
            })
    }

    /// True when node `viewer`'s recorded owner of `slot` is `owner`.
    pub fn sees_owner(&self, viewer: usize, slot: u16, owner: usize) -> bool {
        self.clusters[viewer].slot_owner(slot) == Some(self.id_of(owner))
    }

    /// Kinds of messages node `i` has had delivered to anyone.
    #[allow(dead_code)]
    pub fn sent_kinds(&self, i: usize) -> Vec<MessageKind> {
        self.log
            .iter()
            .filter(|d| d.from == i)
            .map(|d| d.kind)
            .collect()
    }
}

/// A config with timers small enough for wall-clock tests.
pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        node_timeout_ms: 150,
        tick_interval_ms: 10,
        failover_base_delay_ms: 40,
        failover_rank_delay_ms: 100,
        ..ClusterConfig::default()
    }
}
