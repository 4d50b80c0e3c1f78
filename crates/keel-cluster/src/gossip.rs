//! Gossip engine: the periodic tick and the reaction to every inbound
//! message.
//!
//! Each tick repairs links and probes peers; each heartbeat carries a small
//! random sample of third-party facts, which is what lets the membership
//! view converge in a few rounds without every node talking to every other
//! node every round.

use std::net::{IpAddr, SocketAddr};

use rand::prelude::IndexedRandom;
use tracing::{debug, info, trace, warn};

use crate::cluster::{
    Cluster, ClusterEvent, ConnectRequest, DeferredAction, Destination, Outbound, TickActions,
};
use crate::message::{GossipFact, Message, MessageKind, Payload};
use crate::node::{LinkId, Node, NodeFlags, NodeId, NodeRole};
use crate::time::now_ms;

/// What the host should do after one inbound message.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    pub sends: Vec<Outbound>,
    /// The link the message arrived on must be torn down (protocol or
    /// identity error).
    pub close_link: bool,
}

impl Cluster {
    /// Runs one coordination tick: handshake GC, link repair, liveness
    /// probing, failover progress, replica rebalancing and verdict
    /// re-evaluation.
    pub fn tick(&mut self) -> TickActions {
        let now = now_ms();
        self.tick_count += 1;
        let mut actions = TickActions::new();

        // expire handshakes that never completed
        let handshake_timeout = self.config.handshake_timeout_ms();
        let expired: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| {
                n.flags.handshake && now.saturating_sub(n.created_ms) > handshake_timeout
            })
            .map(|n| n.id)
            .collect();
        for id in expired {
            debug!(%id, "handshake expired, dropping node");
            self.remove_node(id);
        }

        // ask the host to dial every addressable node we have no link to
        for node in self.nodes.values() {
            if node.id == self.myself_id || node.link.is_some() || node.flags.noaddr {
                continue;
            }
            let Some(ip) = node.ip else { continue };
            actions.connects.push(ConnectRequest {
                node: node.id,
                addr: SocketAddr::new(ip, node.port),
            });
        }

        // once a second (every 10 ticks): probe the stalest of a few random
        // peers, so ping load stays O(1) per tick regardless of cluster size
        if self.tick_count % 10 == 0 {
            let candidates: Vec<(NodeId, u64)> = self
                .nodes
                .values()
                .filter(|n| {
                    n.id != self.myself_id
                        && n.link.is_some()
                        && n.ping_sent == 0
                        && !n.flags.handshake
                })
                .map(|n| (n.id, n.pong_received))
                .collect();
            let sample: Vec<(NodeId, u64)> = candidates
                .choose_multiple(&mut rand::rng(), self.config.probe_sample)
                .copied()
                .collect();
            if let Some(&(target, _)) = sample.iter().min_by_key(|(_, pong)| *pong) {
                trace!(node = %target, "probing stalest peer");
                let ping = self.send_heartbeat(target, MessageKind::Ping);
                actions.sends.push(ping);
            }
        }

        // per-node timers: link recycling, proactive pings, pfail marking
        let half_timeout = self.config.node_timeout_ms / 2;
        let mut to_ping = Vec::new();
        let mut stale_links = Vec::new();
        let mut newly_suspected = Vec::new();
        for node in self.nodes.values() {
            if node.id == self.myself_id || node.flags.handshake {
                continue;
            }
            // a ping unanswered for half the timeout means the connection
            // itself may be wedged; recycle it so the reconnect carries a
            // fresh ping while the original timeout keeps counting
            if let Some(link) = node.link {
                if node.ping_sent != 0
                    && node.pong_received < node.ping_sent
                    && now.saturating_sub(node.ping_sent) > half_timeout
                {
                    stale_links.push((node.id, link));
                }
            }
            if node.link.is_some()
                && node.ping_sent == 0
                && now.saturating_sub(node.pong_received) > half_timeout
            {
                to_ping.push(node.id);
            }
            if node.ping_sent != 0
                && now.saturating_sub(node.ping_sent) > self.config.node_timeout_ms
                && !node.flags.pfail
                && !node.flags.fail
            {
                newly_suspected.push(node.id);
            }
        }
        for (id, link) in stale_links {
            trace!(node = %id, "recycling unresponsive link");
            if let Some(node) = self.nodes.get_mut(&id) {
                node.link = None;
            }
            self.links.remove(&link);
            self.dead_links.push(link);
        }
        for id in to_ping {
            let ping = self.send_heartbeat(id, MessageKind::Ping);
            actions.sends.push(ping);
        }
        for id in newly_suspected {
            if let Some(node) = self.nodes.get_mut(&id) {
                warn!(%id, "no heartbeat reply within node timeout, suspecting");
                node.flags.pfail = true;
            }
            self.push_deferred(DeferredAction::RecomputeState);
            // an existing report quorum may already be enough
            self.mark_node_failing(id, &mut actions.sends);
        }

        self.manual_failover_tick();
        self.failover_tick(&mut actions.sends);
        self.replica_migration_tick();
        self.update_state();

        actions
    }

    /// Builds and accounts a heartbeat toward `target`, stamping the ping
    /// timer if no reply is already outstanding.
    pub(crate) fn send_heartbeat(&mut self, target: NodeId, kind: MessageKind) -> Outbound {
        let now = now_ms();
        if let Some(node) = self.nodes.get_mut(&target) {
            if node.ping_sent == 0 {
                node.ping_sent = now;
            }
        }
        let facts = self.gossip_facts_for(target);
        self.outbound(Destination::Node(target), kind, Payload::Heartbeat(facts))
    }

    /// Samples up to `gossip_facts` third-party facts for a heartbeat to
    /// `recipient`.
    ///
    /// Excluded: ourselves (the header carries that), the recipient,
    /// unconfirmed or address-less nodes, and link-less nodes owning no
    /// slots (nothing useful to say about them yet).
    pub(crate) fn gossip_facts_for(&self, recipient: NodeId) -> Vec<GossipFact> {
        let eligible: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| {
                n.id != self.myself_id
                    && n.id != recipient
                    && !n.flags.handshake
                    && !n.flags.noaddr
                    && n.ip.is_some()
                    && !(n.link.is_none() && n.slot_count() == 0)
            })
            .collect();
        eligible
            .choose_multiple(&mut rand::rng(), self.config.gossip_facts)
            .filter_map(|n| {
                Some(GossipFact {
                    id: n.id,
                    ping_sent: (n.ping_sent / 1000) as u32,
                    pong_received: (n.pong_received / 1000) as u32,
                    ip: n.ip?,
                    port: n.port,
                    flags: n.flags.to_wire(n.role, false),
                })
            })
            .collect()
    }

    /// Applies one decoded inbound message.
    ///
    /// `link` is the link it arrived on (outbound-named or anonymous
    /// inbound) and `remote_ip` the socket's peer address, which doubles as
    /// the sender's advertised ip.
    pub fn handle_message(
        &mut self,
        link: LinkId,
        remote_ip: IpAddr,
        msg: Message,
    ) -> HandleOutcome {
        let mut out = HandleOutcome::default();
        let hdr = &msg.header;
        let kind = hdr.kind;
        self.stats.received[kind.as_u16() as usize] += 1;

        if hdr.sender == self.myself_id {
            return out;
        }

        trace!(kind = kind.name(), sender = %hdr.sender, "message received");

        // epoch ratchet: higher epochs are adopted from any message
        self.ratchet_epoch(hdr.current_epoch);

        // identity handling for named outbound links
        if let Some(&link_node) = self.links.get(&link) {
            let in_handshake = self
                .nodes
                .get(&link_node)
                .map(|n| n.flags.handshake)
                .unwrap_or(false);
            if in_handshake {
                if self.nodes.contains_key(&hdr.sender) {
                    // the real node is already known under its own id; the
                    // placeholder (and this link) are redundant
                    debug!(placeholder = %link_node, real = %hdr.sender,
                           "handshake hit an already-known node");
                    self.remove_node(link_node);
                    out.close_link = true;
                } else {
                    self.rename_node(link_node, hdr.sender);
                    if let Some(node) = self.nodes.get_mut(&hdr.sender) {
                        node.flags.handshake = false;
                    }
                    self.push_deferred(DeferredAction::SaveTable);
                }
            } else if link_node != hdr.sender {
                // established link suddenly speaks with another identity:
                // the address mapping is wrong, force rediscovery
                warn!(expected = %link_node, got = %hdr.sender,
                      "identity mismatch on established link");
                if let Some(node) = self.nodes.get_mut(&link_node) {
                    node.flags.noaddr = true;
                    node.ip = None;
                    node.link = None;
                }
                self.links.remove(&link);
                out.close_link = true;
                self.push_deferred(DeferredAction::SaveTable);
                return out;
            }
        }

        // a Meet from a stranger introduces it: record a handshake placeholder
        // pointed at the socket address and let the handshake confirm identity
        if kind == MessageKind::Meet && !self.nodes.contains_key(&hdr.sender) {
            if !self.handshake_in_progress(remote_ip, hdr.port) {
                info!(ip = %remote_ip, port = hdr.port, "met by a new node");
                let _ = self.add_node(Node::handshake(remote_ip, hdr.port));
            }
        }

        let sender_known = self.nodes.contains_key(&hdr.sender);
        let on_named_link = self.links.get(&link) == Some(&hdr.sender);

        if sender_known {
            self.absorb_sender_state(link, remote_ip, &msg, &mut out.sends);
        }

        match &msg.payload {
            Payload::Heartbeat(facts) => {
                if matches!(kind, MessageKind::Ping | MessageKind::Meet) {
                    // always answer, even to strangers: replying costs
                    // nothing and lets a recovering node learn it is
                    // reachable again
                    let reply_facts = self.gossip_facts_for(hdr.sender);
                    let pong = self.outbound(
                        Destination::Reply(link),
                        MessageKind::Pong,
                        Payload::Heartbeat(reply_facts),
                    );
                    out.sends.push(pong);
                }
                if kind == MessageKind::Pong && on_named_link {
                    let now = now_ms();
                    if let Some(node) = self.nodes.get_mut(&hdr.sender) {
                        node.pong_received = now;
                        node.ping_sent = 0;
                        node.flags.meet = false;
                        if node.flags.pfail {
                            debug!(node = %hdr.sender, "suspicion lifted");
                            node.flags.pfail = false;
                            self.push_deferred(DeferredAction::RecomputeState);
                            self.push_deferred(DeferredAction::SaveTable);
                        }
                    }
                }
                if sender_known {
                    self.process_gossip_facts(hdr.sender, facts, &mut out.sends);
                }
            }
            Payload::Fail { node } => {
                if sender_known {
                    self.handle_fail_assertion(hdr.sender, *node);
                }
            }
            Payload::Publish { channel, payload } => {
                self.emit(ClusterEvent::Publish {
                    channel: channel.clone(),
                    payload: payload.clone(),
                });
            }
            Payload::Update {
                node,
                config_epoch,
                slots,
            } => {
                if sender_known {
                    self.handle_ownership_update(*node, *config_epoch, slots.clone());
                }
            }
            Payload::Empty => match kind {
                MessageKind::VoteRequest => {
                    if sender_known {
                        self.handle_vote_request(link, &msg, &mut out.sends);
                    }
                }
                MessageKind::VoteGrant => {
                    if sender_known {
                        self.handle_vote_grant(&msg, &mut out.sends);
                    }
                }
                MessageKind::MfStart => {
                    if sender_known {
                        self.handle_mfstart(hdr.sender);
                    }
                }
                _ => {}
            },
        }

        out
    }

    /// Merges the sender's self-reported header state into its node record:
    /// address rediscovery, role and primary changes, replication offset,
    /// config epoch, slot claims and manual-failover offset capture.
    fn absorb_sender_state(
        &mut self,
        link: LinkId,
        remote_ip: IpAddr,
        msg: &Message,
        sends: &mut Vec<Outbound>,
    ) {
        let hdr = &msg.header;
        let sender = hdr.sender;

        // any valid message demonstrates the node is alive again
        self.clear_fail_if_recovered(sender);

        let mut save = false;
        if let Some(node) = self.nodes.get_mut(&sender) {
            if node.flags.noaddr {
                debug!(%sender, ip = %remote_ip, "rediscovered node address");
                node.ip = Some(remote_ip);
                node.port = hdr.port;
                node.flags.noaddr = false;
                save = true;
            }
            node.repl_offset = hdr.repl_offset;
        }

        match hdr.primary {
            None => {
                // sender presents itself as a primary
                let was_replica = self
                    .nodes
                    .get(&sender)
                    .map(|n| n.role == NodeRole::Replica)
                    .unwrap_or(false);
                if was_replica {
                    info!(%sender, "node switched role to primary");
                    self.set_node_primary(sender, None);
                    save = true;
                    self.push_deferred(DeferredAction::RecomputeState);
                }
                if let Some(node) = self.nodes.get_mut(&sender) {
                    if hdr.config_epoch > node.config_epoch {
                        node.config_epoch = hdr.config_epoch;
                        save = true;
                    }
                }
            }
            Some(primary_id) => {
                let (was_primary, changed) = self
                    .nodes
                    .get(&sender)
                    .map(|n| {
                        (
                            n.role == NodeRole::Primary,
                            n.primary != Some(primary_id),
                        )
                    })
                    .unwrap_or((false, false));
                if was_primary || changed {
                    if was_primary {
                        info!(%sender, primary = %primary_id, "primary demoted to replica");
                        // a primary turned replica no longer owns anything
                        let owned: Vec<u16> = self
                            .nodes
                            .get(&sender)
                            .map(|n| n.slots.iter().collect())
                            .unwrap_or_default();
                        for slot in owned {
                            self.assign_slot(slot, None);
                        }
                        self.push_deferred(DeferredAction::RecomputeState);
                    }
                    self.set_node_primary(sender, Some(primary_id));
                    save = true;
                }
            }
        }

        // slot ownership reconciliation for primary senders
        if hdr.primary.is_none() {
            if !hdr.slots.is_empty() {
                self.update_slots_from_claim(sender, hdr.config_epoch, &hdr.slots);
            }
            if let Some(update) = self.check_stale_claim(link, hdr) {
                sends.push(update);
            }
            let my_epoch = self.myself().config_epoch;
            if hdr.config_epoch != 0 && hdr.config_epoch == my_epoch {
                self.handle_epoch_collision(sender, hdr.config_epoch);
            }
        }

        // manual failover: capture the paused primary's offset
        if hdr.mflags.paused
            && self.myself().primary == Some(sender)
            && self.mf.deadline != 0
        {
            self.mf.primary_offset = Some(hdr.repl_offset);
            self.mf_check_offset();
        }

        if save {
            self.push_deferred(DeferredAction::SaveTable);
        }
    }

    /// Reacts to the third-party facts of a heartbeat.
    fn process_gossip_facts(
        &mut self,
        sender: NodeId,
        facts: &[GossipFact],
        sends: &mut Vec<Outbound>,
    ) {
        let sender_is_primary = self
            .nodes
            .get(&sender)
            .map(|n| n.role == NodeRole::Primary)
            .unwrap_or(false);

        for fact in facts {
            if fact.id == self.myself_id {
                continue;
            }
            let (_, fact_flags) = NodeFlags::from_wire(fact.flags);

            if self.nodes.contains_key(&fact.id) {
                // merge failure information; only primaries' reports count
                if sender_is_primary {
                    if fact_flags.fail || fact_flags.pfail {
                        self.add_fail_report(fact.id, sender);
                        self.mark_node_failing(fact.id, sends);
                    } else {
                        self.remove_fail_report(fact.id, sender);
                    }
                }
                if let Some(node) = self.nodes.get_mut(&fact.id) {
                    // adopt a fresher reply timestamp so our timers track
                    // reality even for nodes we rarely ping ourselves
                    let fact_pong_ms = fact.pong_received as u64 * 1000;
                    if fact_pong_ms > node.pong_received
                        && node.ping_sent == 0
                        && !node.flags.fail
                        && !node.flags.pfail
                    {
                        node.pong_received = fact_pong_ms;
                    }
                    // third parties can also resolve a lost address
                    if node.flags.noaddr && !fact_flags.noaddr && !ip_unspecified(fact.ip) {
                        node.ip = Some(fact.ip);
                        node.port = fact.port;
                        node.flags.noaddr = false;
                        self.push_deferred(DeferredAction::SaveTable);
                    }
                }
            } else {
                // an unknown node: start a handshake toward it, unless it
                // was recently and deliberately forgotten
                if fact_flags.noaddr || ip_unspecified(fact.ip) {
                    continue;
                }
                if self.blacklist.contains(&fact.id) {
                    trace!(id = %fact.id, "ignoring gossip about blacklisted node");
                    continue;
                }
                if self.handshake_in_progress(fact.ip, fact.port) {
                    continue;
                }
                debug!(id = %fact.id, ip = %fact.ip, port = fact.port,
                       "learned of new node via gossip, starting handshake");
                let _ = self.add_node(Node::handshake(fact.ip, fact.port));
            }
        }
    }

    /// Applies an explicit "node X is down" assertion from a peer that saw
    /// quorum, collapsing convergence to one message.
    fn handle_fail_assertion(&mut self, sender: NodeId, about: NodeId) {
        if about == self.myself_id {
            // we are evidently alive; our heartbeats will refute this
            return;
        }
        let Some(node) = self.nodes.get_mut(&about) else {
            return;
        };
        if node.flags.fail {
            return;
        }
        warn!(%about, %sender, "peer asserts node is down, adopting verdict");
        node.flags.fail = true;
        node.flags.pfail = false;
        node.fail_time = now_ms();
        self.emit(ClusterEvent::NodeFailed(about));
        self.push_deferred(DeferredAction::RecomputeState);
        self.push_deferred(DeferredAction::SaveTable);
    }

    /// Applies a pushed ownership snapshot for one node.
    fn handle_ownership_update(
        &mut self,
        about: NodeId,
        config_epoch: u64,
        slots: crate::slots::SlotBitmap,
    ) {
        let Some(node) = self.nodes.get(&about) else {
            return;
        };
        if node.config_epoch >= config_epoch {
            return;
        }
        debug!(%about, config_epoch, "applying ownership update");
        self.update_slots_from_claim(about, config_epoch, &slots);
        if let Some(node) = self.nodes.get_mut(&about) {
            if node.config_epoch < config_epoch {
                node.config_epoch = config_epoch;
            }
        }
        self.push_deferred(DeferredAction::SaveTable);
    }

    /// Takes every slot the claim wins (strictly higher config epoch, or
    /// currently unassigned) away from its previous owner.
    ///
    /// Side effects: slots we owned ourselves are reported orphaned so the
    /// storage layer purges leftover keys; if this strips the local node's
    /// primary (or the local primary itself) of its last slot, the local
    /// node re-parents to the claimant.
    pub(crate) fn update_slots_from_claim(
        &mut self,
        claimant: NodeId,
        claimed_epoch: u64,
        claimed: &crate::slots::SlotBitmap,
    ) {
        let curmaster = self.my_primary_id();
        let mut new_owner_of_mine: Option<NodeId> = None;
        let mut dirty: Vec<u16> = Vec::new();
        let mut changed = false;

        for slot in claimed.iter() {
            // admin migration intents are never overridden by gossip
            if self.importing_from.contains_key(&slot) {
                continue;
            }
            let cur = self.slot_owner(slot);
            if cur == Some(claimant) {
                continue;
            }
            let cur_epoch = cur
                .and_then(|id| self.nodes.get(&id))
                .map(|n| n.config_epoch)
                .unwrap_or(0);
            if cur.is_none() || cur_epoch < claimed_epoch {
                if cur == Some(self.myself_id) {
                    dirty.push(slot);
                }
                if cur == Some(curmaster) {
                    new_owner_of_mine = Some(claimant);
                }
                self.assign_slot(slot, Some(claimant));
                changed = true;
            }
        }

        if changed {
            if let Some(node) = self.nodes.get_mut(&claimant) {
                if node.config_epoch < claimed_epoch {
                    node.config_epoch = claimed_epoch;
                }
            }
            self.push_deferred(DeferredAction::RecomputeState);
            self.push_deferred(DeferredAction::SaveTable);
        }

        if let Some(new_master) = new_owner_of_mine {
            let master_emptied = self
                .nodes
                .get(&curmaster)
                .map(|n| n.slot_count() == 0)
                .unwrap_or(false);
            if master_emptied && new_master != curmaster {
                info!(primary = %new_master,
                      "lost all slots to a reconfigured owner, becoming its replica");
                self.set_node_primary(self.myself_id, Some(new_master));
                self.emit(ClusterEvent::DemotedToReplica {
                    primary: new_master,
                });
                self.push_deferred(DeferredAction::FsyncTable);
                self.push_deferred(DeferredAction::RecomputeState);
            }
        }

        if !dirty.is_empty() {
            self.emit(ClusterEvent::SlotsOrphaned(dirty));
        }
    }

    /// If the sender claims a slot we know belongs to someone with a higher
    /// config epoch, push that owner's snapshot back so the sender catches
    /// up. Rejection-by-better-information is the protocol's only feedback.
    fn check_stale_claim(&mut self, link: LinkId, hdr: &crate::message::Header) -> Option<Outbound> {
        for slot in hdr.slots.iter() {
            let Some(owner_id) = self.slot_owner(slot) else {
                continue;
            };
            if owner_id == hdr.sender {
                continue;
            }
            let Some(owner) = self.nodes.get(&owner_id) else {
                continue;
            };
            if owner.config_epoch > hdr.config_epoch {
                let payload = Payload::Update {
                    node: owner_id,
                    config_epoch: owner.config_epoch,
                    slots: owner.slots.clone(),
                };
                debug!(stale = %hdr.sender, owner = %owner_id, slot,
                       "sender has stale slot ownership, pushing update");
                return Some(self.outbound(
                    Destination::Reply(link),
                    MessageKind::Update,
                    payload,
                ));
            }
        }
        None
    }

    /// True when some node (handshake or established) already covers this
    /// address, so gossip cannot spawn duplicate handshakes.
    fn handshake_in_progress(&self, ip: IpAddr, port: u16) -> bool {
        self.nodes
            .values()
            .any(|n| n.ip == Some(ip) && n.port == port)
    }
}

fn ip_unspecified(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{add_peer, cluster};
    use crate::message::{Header, MessageFlags};
    use crate::slots::SlotBitmap;
    use crate::health::ClusterVerdict;

    fn peer_header(kind: MessageKind, sender: NodeId, port: u16) -> Header {
        Header {
            kind,
            current_epoch: 0,
            config_epoch: 0,
            repl_offset: 0,
            sender,
            slots: SlotBitmap::new(),
            primary: None,
            port,
            flags: NodeFlags::default().to_wire(NodeRole::Primary, false),
            verdict: ClusterVerdict::Ok,
            mflags: MessageFlags::default(),
        }
    }

    fn heartbeat(kind: MessageKind, sender: NodeId, port: u16, facts: Vec<GossipFact>) -> Message {
        Message {
            header: peer_header(kind, sender, port),
            payload: Payload::Heartbeat(facts),
        }
    }

    #[test]
    fn tick_requests_connects_for_linkless_nodes() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        let actions = c.tick();
        assert!(actions.connects.iter().any(|r| r.node == peer));
    }

    #[test]
    fn ping_gets_pong_reply_even_from_stranger() {
        let (mut c, _rx) = cluster(7000);
        let stranger = NodeId::random();
        let msg = heartbeat(MessageKind::Ping, stranger, 7009, vec![]);
        let out = c.handle_message(LinkId(9), "127.0.0.1".parse().unwrap(), msg);
        assert_eq!(out.sends.len(), 1);
        assert_eq!(out.sends[0].message.header.kind, MessageKind::Pong);
        assert_eq!(out.sends[0].dest, Destination::Reply(LinkId(9)));
    }

    #[test]
    fn meet_from_stranger_creates_handshake_node() {
        let (mut c, _rx) = cluster(7000);
        let stranger = NodeId::random();
        let msg = heartbeat(MessageKind::Meet, stranger, 7005, vec![]);
        c.handle_message(LinkId(1), "10.0.0.9".parse().unwrap(), msg);

        let hs: Vec<&Node> = c.nodes().filter(|n| n.flags.handshake).collect();
        assert_eq!(hs.len(), 1);
        assert_eq!(hs[0].ip, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(hs[0].port, 7005);
    }

    #[test]
    fn gossip_fact_starts_handshake_unless_blacklisted() {
        let (mut c, _rx) = cluster(7000);
        let sender = add_peer(&mut c, 7001, NodeRole::Primary);
        let unknown = NodeId::random();
        let fact = GossipFact {
            id: unknown,
            ping_sent: 0,
            pong_received: 0,
            ip: "10.0.0.5".parse().unwrap(),
            port: 7005,
            flags: NodeFlags::default().to_wire(NodeRole::Primary, false),
        };

        let msg = heartbeat(MessageKind::Ping, sender, 7001, vec![fact.clone()]);
        c.handle_message(LinkId(2), "127.0.0.1".parse().unwrap(), msg);
        assert!(c.nodes().any(|n| n.flags.handshake && n.port == 7005));

        // a blacklisted id is never re-learned
        let (mut c2, _rx2) = cluster(7000);
        let sender2 = add_peer(&mut c2, 7001, NodeRole::Primary);
        c2.blacklist.add(unknown);
        let msg = heartbeat(MessageKind::Ping, sender2, 7001, vec![fact]);
        c2.handle_message(LinkId(2), "127.0.0.1".parse().unwrap(), msg);
        assert!(!c2.nodes().any(|n| n.flags.handshake));
    }

    #[test]
    fn handshake_completion_renames_placeholder() {
        let (mut c, _rx) = cluster(7000);
        let placeholder = Node::handshake("10.0.0.5".parse().unwrap(), 7005);
        let placeholder_id = placeholder.id;
        c.add_node(placeholder).unwrap();

        let link = LinkId(3);
        c.link_established(placeholder_id, link).unwrap();

        let real_id = NodeId::random();
        let pong = heartbeat(MessageKind::Pong, real_id, 7005, vec![]);
        c.handle_message(link, "10.0.0.5".parse().unwrap(), pong);

        assert!(c.node(&placeholder_id).is_none());
        let real = c.node(&real_id).expect("renamed to real id");
        assert!(!real.flags.handshake);
        assert!(!real.flags.meet);
        assert!(real.pong_received > 0);
    }

    #[test]
    fn identity_mismatch_marks_noaddr_and_closes_link() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        let link = LinkId(4);
        c.link_established(peer, link).unwrap();
        // established links complete the handshake implicitly in add_peer
        c.nodes.get_mut(&peer).unwrap().flags.handshake = false;

        let imposter = NodeId::random();
        let msg = heartbeat(MessageKind::Ping, imposter, 7001, vec![]);
        let out = c.handle_message(link, "127.0.0.1".parse().unwrap(), msg);

        assert!(out.close_link);
        let node = c.node(&peer).unwrap();
        assert!(node.flags.noaddr);
        assert!(node.ip.is_none());
        assert!(node.link.is_none());
    }

    #[test]
    fn pong_clears_suspicion_and_resets_timers() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        let link = LinkId(5);
        c.link_established(peer, link).unwrap();
        {
            let node = c.nodes.get_mut(&peer).unwrap();
            node.flags.pfail = true;
            node.ping_sent = 1;
        }

        let pong = heartbeat(MessageKind::Pong, peer, 7001, vec![]);
        c.handle_message(link, "127.0.0.1".parse().unwrap(), pong);

        let node = c.node(&peer).unwrap();
        assert!(!node.flags.pfail);
        assert_eq!(node.ping_sent, 0);
        assert!(node.pong_received > 0);
    }

    #[test]
    fn higher_epoch_claim_takes_slot_and_orphans_keys() {
        let (mut c, mut rx) = cluster(7000);
        let me = c.myself_id();
        c.assign_slot(10, Some(me));
        c.myself_mut().config_epoch = 1;
        // keep a second slot so we do not demote ourselves
        c.assign_slot(11, Some(me));

        let claimant = add_peer(&mut c, 7001, NodeRole::Primary);
        let mut claimed = SlotBitmap::new();
        claimed.insert(10);
        c.update_slots_from_claim(claimant, 5, &claimed);

        assert_eq!(c.slot_owner(10), Some(claimant));
        assert_eq!(c.slot_owner(11), Some(me));

        let mut orphaned = None;
        while let Ok(ev) = rx.try_recv() {
            if let ClusterEvent::SlotsOrphaned(slots) = ev {
                orphaned = Some(slots);
            }
        }
        assert_eq!(orphaned, Some(vec![10]));
    }

    #[test]
    fn losing_every_slot_demotes_to_replica_of_claimant() {
        let (mut c, mut rx) = cluster(7000);
        let me = c.myself_id();
        c.assign_slot(10, Some(me));
        c.myself_mut().config_epoch = 1;

        let claimant = add_peer(&mut c, 7001, NodeRole::Primary);
        let mut claimed = SlotBitmap::new();
        claimed.insert(10);
        c.update_slots_from_claim(claimant, 5, &claimed);

        let myself = c.myself();
        assert_eq!(myself.role, NodeRole::Replica);
        assert_eq!(myself.primary, Some(claimant));
        let demoted = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|ev| matches!(ev, ClusterEvent::DemotedToReplica { primary } if primary == claimant));
        assert!(demoted);
    }

    #[test]
    fn lower_epoch_claim_is_refused_and_corrected() {
        let (mut c, _rx) = cluster(7000);
        let owner = add_peer(&mut c, 7001, NodeRole::Primary);
        c.nodes.get_mut(&owner).unwrap().config_epoch = 9;
        c.assign_slot(10, Some(owner));

        let stale = add_peer(&mut c, 7002, NodeRole::Primary);
        let mut hdr = peer_header(MessageKind::Ping, stale, 7002);
        hdr.config_epoch = 2;
        hdr.slots.insert(10);
        let msg = Message {
            header: hdr,
            payload: Payload::Heartbeat(vec![]),
        };
        let out = c.handle_message(LinkId(6), "127.0.0.1".parse().unwrap(), msg);

        // ownership unchanged, and the stale node gets an Update push
        assert_eq!(c.slot_owner(10), Some(owner));
        assert!(out
            .sends
            .iter()
            .any(|o| o.message.header.kind == MessageKind::Update));
    }

    #[test]
    fn importing_slots_are_protected_from_gossip() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        c.assign_slot(10, Some(me));
        let src = add_peer(&mut c, 7001, NodeRole::Primary);
        c.importing_from.insert(10, src);

        let claimant = add_peer(&mut c, 7002, NodeRole::Primary);
        let mut claimed = SlotBitmap::new();
        claimed.insert(10);
        c.update_slots_from_claim(claimant, 99, &claimed);

        assert_eq!(c.slot_owner(10), Some(me));
    }

    #[test]
    fn fail_assertion_adopted_immediately() {
        let (mut c, _rx) = cluster(7000);
        let sender = add_peer(&mut c, 7001, NodeRole::Primary);
        let victim = add_peer(&mut c, 7002, NodeRole::Primary);

        let msg = Message {
            header: peer_header(MessageKind::Fail, sender, 7001),
            payload: Payload::Fail { node: victim },
        };
        c.handle_message(LinkId(7), "127.0.0.1".parse().unwrap(), msg);

        let node = c.node(&victim).unwrap();
        assert!(node.flags.fail);
        assert!(!node.flags.pfail);
    }

    #[test]
    fn publish_relays_to_host() {
        let (mut c, mut rx) = cluster(7000);
        let sender = add_peer(&mut c, 7001, NodeRole::Primary);
        let msg = Message {
            header: peer_header(MessageKind::Publish, sender, 7001),
            payload: Payload::Publish {
                channel: bytes::Bytes::from_static(b"news"),
                payload: bytes::Bytes::from_static(b"hi"),
            },
        };
        c.handle_message(LinkId(8), "127.0.0.1".parse().unwrap(), msg);

        let got = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|ev| matches!(ev, ClusterEvent::Publish { ref channel, .. } if channel == "news"));
        assert!(got);
    }

    #[test]
    fn gossip_facts_exclude_recipient_and_self() {
        let (mut c, _rx) = cluster(7000);
        let a = add_peer(&mut c, 7001, NodeRole::Primary);
        let b = add_peer(&mut c, 7002, NodeRole::Primary);
        c.nodes.get_mut(&a).unwrap().link = Some(LinkId(1));
        c.nodes.get_mut(&b).unwrap().link = Some(LinkId(2));

        for _ in 0..20 {
            let facts = c.gossip_facts_for(a);
            assert!(facts.iter().all(|f| f.id != a && f.id != c.myself_id()));
        }
    }

    #[test]
    fn linkless_slotless_nodes_not_gossiped() {
        let (mut c, _rx) = cluster(7000);
        let a = add_peer(&mut c, 7001, NodeRole::Primary);
        let b = add_peer(&mut c, 7002, NodeRole::Primary);
        // b has no link and no slots: nothing worth saying
        c.nodes.get_mut(&a).unwrap().link = Some(LinkId(1));

        for _ in 0..20 {
            let facts = c.gossip_facts_for(a);
            assert!(facts.iter().all(|f| f.id != b));
        }
    }

    #[test]
    fn tick_marks_silent_node_suspected() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        c.link_established(peer, LinkId(1)).unwrap();
        // a ping has been outstanding for longer than the node timeout
        c.nodes.get_mut(&peer).unwrap().ping_sent =
            now_ms() - c.config().node_timeout_ms - 50;

        c.tick();
        assert!(c.node(&peer).unwrap().flags.pfail);
    }
}
