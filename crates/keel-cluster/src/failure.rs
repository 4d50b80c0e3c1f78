//! Quorum-based failure detection.
//!
//! A local ping timeout only ever produces a private suspicion (pfail).
//! Suspicions travel as gossip fact flags; each primary's suspicion is
//! recorded as a failure report on the target node. Once the number of
//! distinct reporting primaries (plus the local node, when it is a primary)
//! reaches a majority of slot-owning primaries, the suspicion is promoted
//! to a cluster-wide fact (fail) and broadcast explicitly so everyone
//! converges at once instead of re-deriving the quorum.

use tracing::{debug, warn};

use crate::cluster::{Cluster, ClusterEvent, DeferredAction, Destination, Outbound};
use crate::message::{MessageKind, Payload};
use crate::node::{FailReport, NodeId, NodeRole};
use crate::time::now_ms;

impl Cluster {
    /// Records (or renews) `reporter`'s claim that `about` is unreachable.
    /// Only primaries' reports are recorded; replicas may relay suspicion
    /// flags but do not vote toward quorum.
    pub(crate) fn add_fail_report(&mut self, about: NodeId, reporter: NodeId) {
        if self
            .nodes
            .get(&reporter)
            .map(|n| n.role != NodeRole::Primary)
            .unwrap_or(true)
        {
            return;
        }
        let now = now_ms();
        let Some(node) = self.nodes.get_mut(&about) else {
            return;
        };
        match node.fail_reports.iter_mut().find(|r| r.reporter == reporter) {
            Some(report) => report.time_ms = now,
            None => {
                debug!(%about, %reporter, "failure report added");
                node.fail_reports.push(FailReport {
                    reporter,
                    time_ms: now,
                });
            }
        }
    }

    /// Drops `reporter`'s claim about `about` (the reporter now sees the
    /// node as healthy).
    pub(crate) fn remove_fail_report(&mut self, about: NodeId, reporter: NodeId) {
        if let Some(node) = self.nodes.get_mut(&about) {
            node.fail_reports.retain(|r| r.reporter != reporter);
        }
    }

    /// Counts live failure reports for a node, pruning expired ones so a
    /// long-recovered node stops weighing toward future quorum decisions.
    pub(crate) fn fail_report_count(&mut self, about: NodeId) -> usize {
        let validity = self.config.fail_report_validity_ms();
        let now = now_ms();
        let Some(node) = self.nodes.get_mut(&about) else {
            return 0;
        };
        node.fail_reports
            .retain(|r| now.saturating_sub(r.time_ms) <= validity);
        node.fail_reports.len()
    }

    /// Promotes a private suspicion to a cluster-wide fact when quorum is
    /// reached: the local timeout must have fired, and reporting primaries
    /// (plus ourselves when primary) must reach `floor(size/2) + 1`.
    ///
    /// On promotion by a primary, an explicit Fail assertion is broadcast
    /// so other nodes adopt the verdict instead of re-deriving it.
    pub(crate) fn mark_node_failing(&mut self, about: NodeId, sends: &mut Vec<Outbound>) {
        let locally_suspected = match self.nodes.get(&about) {
            Some(n) if !n.flags.fail => n.flags.pfail,
            _ => return,
        };
        if !locally_suspected {
            return;
        }

        let mut failures = self.fail_report_count(about);
        let myself_votes = self.myself().role == NodeRole::Primary;
        if myself_votes {
            failures += 1;
        }
        let quorum = self.seen_cluster_size / 2 + 1;
        if failures < quorum {
            return;
        }

        warn!(%about, failures, quorum, "quorum reached, marking node down");
        if let Some(node) = self.nodes.get_mut(&about) {
            node.flags.fail = true;
            node.flags.pfail = false;
            node.fail_time = now_ms();
        }
        self.emit(ClusterEvent::NodeFailed(about));
        self.push_deferred(DeferredAction::RecomputeState);
        self.push_deferred(DeferredAction::FsyncTable);

        if myself_votes {
            let fail = self.outbound(
                Destination::Broadcast,
                MessageKind::Fail,
                Payload::Fail { node: about },
            );
            sends.push(fail);
        }
    }

    /// Clears a fail flag when the node is heard from again.
    ///
    /// Asymmetric by design: replicas and slot-less nodes clear instantly,
    /// but a confirmed-down primary that still owns slots only clears after
    /// a multiple of the node timeout with nobody having taken its slots
    /// over. That avoids ownership flapping when a short partition heals
    /// before any failover completed.
    pub(crate) fn clear_fail_if_recovered(&mut self, id: NodeId) {
        let undo_after = self.config.fail_undo_ms();
        let now = now_ms();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if !node.flags.fail {
            return;
        }

        let harmless = node.role == NodeRole::Replica || node.slot_count() == 0;
        let waited_out = node.slot_count() > 0
            && now.saturating_sub(node.fail_time) > undo_after;

        if harmless || waited_out {
            debug!(%id, harmless, "clearing down flag, node is reachable again");
            node.flags.fail = false;
            node.fail_time = 0;
            self.emit(ClusterEvent::NodeRecovered(id));
            self.push_deferred(DeferredAction::RecomputeState);
            self.push_deferred(DeferredAction::SaveTable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{add_peer, cluster};
    use crate::slots::SLOT_COUNT;

    /// Builds `primaries` slot-owning primaries (including the local node)
    /// and recomputes the seen cluster size.
    fn sized_cluster(primaries: usize) -> (Cluster, Vec<NodeId>) {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        let mut ids = vec![me];
        for i in 1..primaries {
            ids.push(add_peer(&mut c, 7000 + i as u16, NodeRole::Primary));
        }
        for slot in 0..SLOT_COUNT {
            let owner = ids[slot as usize % primaries];
            c.assign_slot(slot, Some(owner));
        }
        c.update_state();
        assert_eq!(c.seen_cluster_size, primaries);
        (c, ids)
    }

    /// Quorum monotonicity: a node is marked down only once reports from
    /// distinct primaries (plus self) reach floor(size/2)+1, for cluster
    /// sizes 1, 3, 5 and 7 with synthetically injected reports.
    #[test]
    fn quorum_rule_across_cluster_sizes() {
        for size in [1usize, 3, 5, 7] {
            let (mut c, ids) = sized_cluster(size);
            // victim owns no slots so it never changes the quorum base
            let victim = add_peer(&mut c, 7999, NodeRole::Primary);
            c.nodes.get_mut(&victim).unwrap().flags.pfail = true;

            let quorum = size / 2 + 1;
            let reporters: Vec<NodeId> = ids
                .iter()
                .copied()
                .filter(|id| *id != c.myself_id())
                .collect();
            let mut sends = Vec::new();

            // the local primary contributes one implicit vote; the rest
            // must come from distinct reports
            c.mark_node_failing(victim, &mut sends);
            for (k, reporter) in reporters
                .iter()
                .take(quorum.saturating_sub(1))
                .enumerate()
            {
                assert!(
                    !c.node(&victim).unwrap().flags.fail,
                    "size {size}: marked down after only {k} reports"
                );
                c.add_fail_report(victim, *reporter);
                c.mark_node_failing(victim, &mut sends);
            }

            assert!(
                c.node(&victim).unwrap().flags.fail,
                "size {size}: quorum of {quorum} not honored"
            );
        }
    }

    #[test]
    fn replica_reports_do_not_count() {
        let (mut c, ids) = sized_cluster(4);
        let victim = ids[3];
        let replica = add_peer(&mut c, 7100, NodeRole::Replica);
        c.nodes.get_mut(&victim).unwrap().flags.pfail = true;

        c.add_fail_report(victim, replica);
        assert_eq!(c.fail_report_count(victim), 0);
    }

    #[test]
    fn no_promotion_without_local_timeout() {
        let (mut c, ids) = sized_cluster(3);
        let victim = ids[2];
        // plenty of reports, but no local pfail
        c.add_fail_report(victim, ids[1]);
        let mut sends = Vec::new();
        c.mark_node_failing(victim, &mut sends);
        assert!(!c.node(&victim).unwrap().flags.fail);
    }

    #[test]
    fn promotion_broadcasts_fail_assertion() {
        let (mut c, ids) = sized_cluster(3);
        let victim = ids[2];
        c.nodes.get_mut(&victim).unwrap().flags.pfail = true;
        c.add_fail_report(victim, ids[1]);

        let mut sends = Vec::new();
        c.mark_node_failing(victim, &mut sends);

        assert!(c.node(&victim).unwrap().flags.fail);
        assert!(sends
            .iter()
            .any(|o| matches!(o.message.payload, Payload::Fail { node } if node == victim)));
    }

    #[test]
    fn reports_expire() {
        let (mut c, ids) = sized_cluster(3);
        let victim = ids[2];
        c.add_fail_report(victim, ids[1]);
        assert_eq!(c.fail_report_count(victim), 1);

        // age the report past validity
        c.nodes.get_mut(&victim).unwrap().fail_reports[0].time_ms =
            now_ms() - c.config().fail_report_validity_ms() - 1;
        assert_eq!(c.fail_report_count(victim), 0);
    }

    /// A down node with no slots clears the moment it is heard from,
    /// without any grace window.
    #[test]
    fn slotless_node_recovers_instantly() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        {
            let node = c.nodes.get_mut(&peer).unwrap();
            node.flags.fail = true;
            node.fail_time = now_ms();
        }

        c.clear_fail_if_recovered(peer);
        assert!(!c.node(&peer).unwrap().flags.fail);
    }

    #[test]
    fn slot_owning_primary_recovers_only_after_undo_window() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        c.assign_slot(0, Some(peer));
        {
            let node = c.nodes.get_mut(&peer).unwrap();
            node.flags.fail = true;
            node.fail_time = now_ms();
        }

        // too early: stays down
        c.clear_fail_if_recovered(peer);
        assert!(c.node(&peer).unwrap().flags.fail);

        // after the undo window with its slots untouched: clears
        c.nodes.get_mut(&peer).unwrap().fail_time =
            now_ms() - c.config().fail_undo_ms() - 1;
        c.clear_fail_if_recovered(peer);
        assert!(!c.node(&peer).unwrap().flags.fail);
    }
}
