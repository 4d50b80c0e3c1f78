//! Replica rebalancing: replicas of over-provisioned primaries re-parent
//! themselves to primaries left serving slots with no working replica.
//!
//! Deliberately racy (several siblings could decide in the same round) but
//! self-limiting: it only runs from the strictly best-replicated primary,
//! and only the lexicographically smallest eligible sibling acts.

use tracing::info;

use crate::cluster::{Cluster, ClusterEvent, DeferredAction};
use crate::node::{NodeId, NodeRole};

impl Cluster {
    /// Per-tick check; at most one re-parenting per call.
    pub(crate) fn replica_migration_tick(&mut self) {
        let myself = self.myself();
        if myself.role != NodeRole::Replica {
            return;
        }
        let Some(my_primary) = myself.primary else {
            return;
        };

        // census: working replica count per slot-owning primary, the
        // orphan (slots but zero working replicas), and the global maximum
        let mut orphan: Option<NodeId> = None;
        let mut max_replicas = 0usize;
        let mut my_primary_replicas = 0usize;
        for node in self.nodes.values() {
            if node.role != NodeRole::Primary || node.slot_count() == 0 {
                continue;
            }
            let working = self.working_replicas_of(node.id);
            if working == 0 && !node.flags.fail {
                orphan = Some(node.id);
            }
            max_replicas = max_replicas.max(working);
            if node.id == my_primary {
                my_primary_replicas = working;
            }
        }

        let Some(orphan) = orphan else {
            return;
        };

        // only act from the best-replicated shard, and never drain it below
        // the configured barrier
        if my_primary_replicas != max_replicas
            || max_replicas <= self.config.migration_barrier
        {
            return;
        }

        // tie-break: the smallest working sibling id moves; everyone else
        // stands still. No fairness beyond that is promised.
        let candidate = self
            .nodes
            .get(&my_primary)
            .map(|p| {
                p.replicas
                    .iter()
                    .copied()
                    .filter(|r| self.nodes.get(r).is_some_and(|n| n.is_working()))
                    .min()
            })
            .unwrap_or(None);
        if candidate != Some(self.myself_id) {
            return;
        }

        info!(orphan = %orphan, "re-parenting to orphaned primary");
        self.set_node_primary(self.myself_id, Some(orphan));
        self.emit(ClusterEvent::DemotedToReplica { primary: orphan });
        self.push_deferred(DeferredAction::SaveTable);
    }
}
