//! Cluster verdict evaluation.
//!
//! Each tick derives a single OK/FAIL verdict from slot coverage and
//! primary reachability. The verdict gates whether this node serves client
//! traffic at all, so it errs on the side of FAIL: a node that cannot see a
//! majority of slot-owning primaries cannot trust its own failure
//! judgements.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterEvent};
use crate::node::NodeRole;
use crate::slots::SLOT_COUNT;
use crate::time::now_ms;

/// The binary health verdict for the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterVerdict {
    /// All slots covered by reachable primaries; serve traffic.
    Ok,
    /// Coverage hole or majority unreachable; refuse traffic.
    Fail,
}

impl ClusterVerdict {
    pub fn as_u8(self) -> u8 {
        match self {
            ClusterVerdict::Ok => 0,
            ClusterVerdict::Fail => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ClusterVerdict::Ok),
            1 => Some(ClusterVerdict::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterVerdict::Ok => write!(f, "ok"),
            ClusterVerdict::Fail => write!(f, "fail"),
        }
    }
}

impl Cluster {
    /// Recomputes the verdict and the seen cluster size.
    pub(crate) fn update_state(&mut self) {
        let now = now_ms();
        let mut new_verdict = ClusterVerdict::Ok;

        // every slot must have a non-failing owner
        for slot in 0..SLOT_COUNT {
            match self.slot_owner(slot) {
                None => {
                    new_verdict = ClusterVerdict::Fail;
                    break;
                }
                Some(owner) => {
                    let failing = self
                        .nodes
                        .get(&owner)
                        .map(|n| n.flags.fail)
                        .unwrap_or(true);
                    if failing {
                        new_verdict = ClusterVerdict::Fail;
                        break;
                    }
                }
            }
        }

        // cluster size = distinct primaries owning at least one slot
        let mut size = 0usize;
        let mut unreachable = 0usize;
        for node in self.nodes.values() {
            if node.role == NodeRole::Primary && node.slot_count() > 0 {
                size += 1;
                if node.flags.fail || node.flags.pfail {
                    unreachable += 1;
                }
            }
        }
        self.seen_cluster_size = size;

        if size > 0 && unreachable >= size / 2 + 1 {
            // we are on the minority side of a partition
            self.last_minority_ms = now;
            new_verdict = ClusterVerdict::Fail;
        }

        // a primary rejoining from the minority holds back from serving for
        // a grace window, letting ownership updates land first
        if new_verdict == ClusterVerdict::Ok
            && self.verdict == ClusterVerdict::Fail
            && self.last_minority_ms != 0
        {
            let myself = self.myself();
            let rejoining_primary =
                myself.role == NodeRole::Primary && myself.slot_count() > 0;
            if rejoining_primary
                && now.saturating_sub(self.last_minority_ms) < self.config.rejoin_delay_ms()
            {
                return;
            }
        }

        if new_verdict != self.verdict {
            match new_verdict {
                ClusterVerdict::Ok => info!("cluster state changed: ok"),
                ClusterVerdict::Fail => warn!("cluster state changed: fail"),
            }
            self.verdict = new_verdict;
            self.emit(ClusterEvent::VerdictChanged(new_verdict));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{add_peer, cluster};
    use crate::slots::SLOT_COUNT;

    fn assign_all(c: &mut Cluster, owner: crate::node::NodeId) {
        for slot in 0..SLOT_COUNT {
            c.assign_slot(slot, Some(owner));
        }
    }

    #[test]
    fn verdict_fail_without_coverage() {
        let (mut c, _rx) = cluster(7000);
        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Fail);
    }

    #[test]
    fn verdict_ok_with_full_coverage() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        assign_all(&mut c, me);
        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Ok);
        assert_eq!(c.seen_cluster_size, 1);
    }

    #[test]
    fn verdict_fail_when_owner_failed() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        assign_all(&mut c, me);
        let other = add_peer(&mut c, 7001, NodeRole::Primary);
        c.assign_slot(0, Some(other));
        c.nodes.get_mut(&other).unwrap().flags.fail = true;

        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Fail);
        assert_eq!(c.seen_cluster_size, 2);
    }

    #[test]
    fn verdict_fail_in_minority_partition() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        // three primaries share the slots; two of them are suspected
        let a = add_peer(&mut c, 7001, NodeRole::Primary);
        let b = add_peer(&mut c, 7002, NodeRole::Primary);
        for slot in 0..SLOT_COUNT {
            let owner = match slot % 3 {
                0 => me,
                1 => a,
                _ => b,
            };
            c.assign_slot(slot, Some(owner));
        }
        c.nodes.get_mut(&a).unwrap().flags.pfail = true;
        c.nodes.get_mut(&b).unwrap().flags.pfail = true;

        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Fail);
        assert!(c.last_minority_ms > 0);
    }

    #[test]
    fn rejoin_grace_window_holds_back_ok() {
        let (mut c, _rx) = cluster(7000);
        let me = c.myself_id();
        assign_all(&mut c, me);
        c.verdict = ClusterVerdict::Fail;
        c.last_minority_ms = now_ms();

        // conditions for Ok are met, but the grace window has not elapsed
        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Fail);

        // pretend the window passed
        c.last_minority_ms = now_ms() - c.config.rejoin_delay_ms() - 1;
        c.update_state();
        assert_eq!(c.verdict(), ClusterVerdict::Ok);
    }
}
