//! Failover coordination: the replica-side election state machine and the
//! primary-side vote granting rules.
//!
//! A replica whose primary is confirmed down (or whose admin requested a
//! handover) walks Idle -> DelayScheduled -> RequestingVotes -> Won or back
//! to Idle. The scheduling delay is offset-rank-aware so the replica
//! holding the freshest data usually starts (and wins) first; primaries
//! grant at most one vote per epoch, which is what makes the winner unique.

use std::collections::HashSet;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterEvent, DeferredAction, Destination, Outbound};
use crate::error::ClusterError;
use crate::message::{Message, MessageKind, Payload};
use crate::node::{NodeId, NodeRole};
use crate::time::now_ms;

/// Where the local replica currently stands in an election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverPhase {
    #[default]
    Idle,
    /// Waiting out the rank-based delay before requesting votes.
    DelayScheduled,
    /// Votes requested; collecting grants until the window closes.
    RequestingVotes,
}

/// Replica-side election state.
#[derive(Debug, Default)]
pub struct FailoverState {
    pub phase: FailoverPhase,
    /// When vote requesting may begin (DelayScheduled).
    pub auth_time: u64,
    /// When votes were requested (RequestingVotes).
    pub started: u64,
    /// Epoch this election is contested under.
    pub epoch: u64,
    /// Offset rank at scheduling time; revised upward while waiting.
    pub rank: usize,
    /// Primaries that granted us their vote this election.
    pub votes: HashSet<NodeId>,
    /// Earliest time a new attempt may be scheduled after an abandon.
    pub retry_after: u64,
}

impl FailoverState {
    fn reset(&mut self) {
        *self = FailoverState {
            retry_after: self.retry_after,
            ..FailoverState::default()
        };
    }
}

/// Manual failover bookkeeping, for both roles.
///
/// On the requesting replica: `deadline`, `primary_offset`, `can_start`.
/// On the paused primary: `deadline`, `replica`.
#[derive(Debug, Default)]
pub struct ManualFailoverState {
    /// Hard wall-clock limit; 0 = no manual failover in progress.
    pub deadline: u64,
    /// Primary side: the replica that asked for the handover.
    pub replica: Option<NodeId>,
    /// Replica side: the offset the paused primary reported.
    pub primary_offset: Option<u64>,
    /// Replica side: offsets matched (or force was requested); the election
    /// may begin.
    pub can_start: bool,
}

impl ManualFailoverState {
    pub fn in_progress(&self) -> bool {
        self.deadline != 0
    }
}

impl Cluster {
    /// Admin entry point: request a manual failover of the local replica.
    ///
    /// Without `force`, the primary is asked to pause writes and report its
    /// offset, and the election is deferred until the local replica has
    /// replayed up to exactly that offset (zero data loss). With `force`,
    /// the election starts immediately.
    pub(crate) fn start_manual_failover(
        &mut self,
        force: bool,
    ) -> Result<Option<Outbound>, ClusterError> {
        let myself = self.myself();
        if myself.role == NodeRole::Primary {
            return Err(ClusterError::WrongRole {
                role: "primary".to_string(),
            });
        }
        let primary_id = myself.primary.ok_or_else(|| {
            ClusterError::AdminMisuse("replica has no known primary".to_string())
        })?;
        let primary_failed = self
            .nodes
            .get(&primary_id)
            .map(|n| n.flags.fail)
            .unwrap_or(true);
        if primary_failed && !force {
            return Err(ClusterError::AdminMisuse(
                "primary is down; use FAILOVER FORCE or wait for automatic failover"
                    .to_string(),
            ));
        }

        self.reset_manual_failover();
        self.mf.deadline = now_ms() + self.config.manual_failover_timeout_ms;
        if force {
            info!("forced manual failover: skipping offset synchronization");
            self.mf.can_start = true;
            Ok(None)
        } else {
            info!(primary = %primary_id, "manual failover: asking primary to pause");
            Ok(Some(self.outbound(
                Destination::Node(primary_id),
                MessageKind::MfStart,
                Payload::Empty,
            )))
        }
    }

    /// Primary side: a replica asked us to pause for a planned handover.
    pub(crate) fn handle_mfstart(&mut self, sender: NodeId) {
        if self.myself().role != NodeRole::Primary {
            return;
        }
        let is_my_replica = self
            .nodes
            .get(&sender)
            .map(|n| n.primary == Some(self.myself_id))
            .unwrap_or(false);
        if !is_my_replica || self.mf.in_progress() {
            return;
        }
        let deadline = now_ms() + self.config.manual_failover_timeout_ms;
        self.mf.deadline = deadline;
        self.mf.replica = Some(sender);
        info!(replica = %sender, "manual failover requested, pausing writes");
        // subsequent heartbeats carry the paused flag and our offset
        self.emit(ClusterEvent::PauseWrites {
            deadline_ms: deadline,
        });
    }

    /// Replica side: re-check whether our replayed offset caught up with
    /// the paused primary's reported one.
    ///
    /// If the primary keeps accepting writes from elsewhere during the
    /// pause its offset may never stabilize; no special handling exists for
    /// that, the deadline is the only bound.
    pub(crate) fn mf_check_offset(&mut self) {
        if !self.mf.in_progress() || self.mf.can_start {
            return;
        }
        if let Some(target) = self.mf.primary_offset {
            if self.repl_offset == target {
                info!(offset = target, "replication offset matched, election may start");
                self.mf.can_start = true;
            }
        }
    }

    /// Expires manual failover state past its hard deadline, releasing the
    /// paused-writes state on the primary side.
    pub(crate) fn manual_failover_tick(&mut self) {
        if self.mf.in_progress() && now_ms() > self.mf.deadline {
            warn!("manual failover timed out, aborting");
            self.reset_manual_failover();
        }
    }

    pub(crate) fn reset_manual_failover(&mut self) {
        // only the primary side (the one tracking a requesting replica)
        // ever paused client writes
        let was_pausing = self.mf.in_progress() && self.mf.replica.is_some();
        self.mf = ManualFailoverState::default();
        if was_pausing {
            self.emit(ClusterEvent::ResumeWrites);
        }
    }

    /// Replica-side election driver, run every tick.
    pub(crate) fn failover_tick(&mut self, sends: &mut Vec<Outbound>) {
        let now = now_ms();
        if self.myself().role == NodeRole::Primary {
            return;
        }
        let Some(primary_id) = self.myself().primary else {
            return;
        };
        let manual = self.mf.in_progress() && self.mf.can_start;

        // entry conditions: the primary must be worth replacing, and our
        // data fresh enough to serve from (manual handovers skip the
        // freshness gate; the admin vouched for them)
        let (primary_failed, primary_slots) = self
            .nodes
            .get(&primary_id)
            .map(|p| (p.flags.fail, p.slot_count()))
            .unwrap_or((false, 0));
        let needed = (primary_failed && primary_slots > 0) || manual;
        if !needed {
            if self.failover.phase != FailoverPhase::Idle {
                debug!("primary recovered, abandoning election");
                self.failover.reset();
            }
            return;
        }

        let data_age = now.saturating_sub(self.repl_last_io);
        let max_age = self.config.node_timeout_ms * self.config.replica_validity_factor;
        if !manual && data_age > max_age {
            // too stale to promote without data loss concerns
            return;
        }

        match self.failover.phase {
            FailoverPhase::Idle => {
                if now < self.failover.retry_after {
                    return;
                }
                let rank = self.failover_rank(primary_id);
                let auth_time = if manual {
                    now
                } else {
                    let jitter =
                        rand::rng().random_range(0..=self.config.failover_base_delay_ms);
                    now + self.config.failover_base_delay_ms
                        + jitter
                        + rank as u64 * self.config.failover_rank_delay_ms
                };
                info!(
                    rank,
                    delay_ms = auth_time.saturating_sub(now),
                    "election scheduled"
                );
                self.failover.phase = FailoverPhase::DelayScheduled;
                self.failover.auth_time = auth_time;
                self.failover.rank = rank;
                // tell the siblings our offset so everyone ranks accurately
                let siblings = self.sibling_replicas(primary_id);
                for sibling in siblings {
                    let pong = self.send_heartbeat(sibling, MessageKind::Pong);
                    sends.push(pong);
                }
            }
            FailoverPhase::DelayScheduled => {
                // better-informed siblings may push our start time back
                if !manual {
                    let rank = self.failover_rank(primary_id);
                    if rank > self.failover.rank {
                        let extra =
                            (rank - self.failover.rank) as u64 * self.config.failover_rank_delay_ms;
                        debug!(old = self.failover.rank, new = rank, "rank worsened");
                        self.failover.auth_time += extra;
                        self.failover.rank = rank;
                    }
                }
                if now < self.failover.auth_time {
                    return;
                }
                // bump the epoch and ask every primary for its vote
                self.current_epoch += 1;
                self.failover.epoch = self.current_epoch;
                self.failover.phase = FailoverPhase::RequestingVotes;
                self.failover.started = now;
                self.failover.votes.clear();
                info!(epoch = self.failover.epoch, "requesting election votes");
                self.push_deferred(DeferredAction::FsyncTable);

                let mut request = self.outbound(
                    Destination::Broadcast,
                    MessageKind::VoteRequest,
                    Payload::Empty,
                );
                // replicas claim their primary's slots; the claimed epoch
                // in the header lets voters spot stale shard knowledge
                if let Some(primary) = self.nodes.get(&primary_id) {
                    request.message.header.slots = primary.slots.clone();
                }
                request.message.header.mflags.force_ack = self.mf.in_progress();
                sends.push(request);
            }
            FailoverPhase::RequestingVotes => {
                if now.saturating_sub(self.failover.started) > self.config.election_timeout_ms() {
                    warn!(epoch = self.failover.epoch, "election window expired");
                    let retry_after = now + self.config.election_retry_ms();
                    self.failover.reset();
                    self.failover.retry_after = retry_after;
                }
            }
        }
    }

    /// Number of sibling replicas with a strictly newer replication offset.
    /// Rank 0 starts its election first and usually wins before slower
    /// siblings even begin.
    pub(crate) fn failover_rank(&self, primary_id: NodeId) -> usize {
        let my_offset = self.repl_offset;
        self.nodes
            .get(&primary_id)
            .map(|p| {
                p.replicas
                    .iter()
                    .filter(|r| **r != self.myself_id)
                    .filter_map(|r| self.nodes.get(r))
                    .filter(|n| !n.flags.fail && n.repl_offset > my_offset)
                    .count()
            })
            .unwrap_or(0)
    }

    fn sibling_replicas(&self, primary_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&primary_id)
            .map(|p| {
                p.replicas
                    .iter()
                    .copied()
                    .filter(|r| *r != self.myself_id)
                    .filter(|r| {
                        self.nodes
                            .get(r)
                            .is_some_and(|n| n.link.is_some())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Primary side: decide whether to grant our one vote for this epoch.
    pub(crate) fn handle_vote_request(
        &mut self,
        link: crate::node::LinkId,
        msg: &Message,
        sends: &mut Vec<Outbound>,
    ) {
        let hdr = &msg.header;
        let requester = hdr.sender;
        let now = now_ms();

        // only slot-owning primaries hold a vote
        {
            let myself = self.myself();
            if myself.role != NodeRole::Primary || myself.slot_count() == 0 {
                return;
            }
        }

        // a request from the past cannot win anything
        if hdr.current_epoch < self.current_epoch {
            debug!(%requester, req = hdr.current_epoch, cur = self.current_epoch,
                   "refusing vote: stale epoch");
            return;
        }
        // one vote per epoch, ever
        if self.last_vote_epoch == self.current_epoch {
            debug!(%requester, epoch = self.current_epoch,
                   "refusing vote: already voted this epoch");
            return;
        }

        // the requester must be a replica of a primary we agree is down,
        // unless the manual-failover flag vouches for it
        let Some(requester_primary) = self
            .nodes
            .get(&requester)
            .and_then(|n| n.primary)
        else {
            return;
        };
        let primary_failed = self
            .nodes
            .get(&requester_primary)
            .map(|n| n.flags.fail)
            .unwrap_or(false);
        if !primary_failed && !hdr.mflags.force_ack {
            debug!(%requester, "refusing vote: primary is not down");
            return;
        }

        // rate-limit: one vote per primary's replica set per 2 timeouts
        let voted_recently = self
            .nodes
            .get(&requester_primary)
            .map(|n| now.saturating_sub(n.voted_time) < self.config.vote_interval_ms())
            .unwrap_or(false);
        if voted_recently {
            debug!(%requester, "refusing vote: voted for this shard too recently");
            return;
        }

        // never endorse stale shard knowledge: every claimed slot must not
        // be owned by someone else with a higher config epoch
        for slot in hdr.slots.iter() {
            if let Some(owner) = self.slot_owner(slot) {
                if owner != requester_primary && owner != requester {
                    let owner_epoch = self
                        .nodes
                        .get(&owner)
                        .map(|n| n.config_epoch)
                        .unwrap_or(0);
                    if owner_epoch > hdr.config_epoch {
                        debug!(%requester, slot, "refusing vote: claimed slots are stale");
                        return;
                    }
                }
            }
        }

        self.last_vote_epoch = self.current_epoch;
        if let Some(primary) = self.nodes.get_mut(&requester_primary) {
            primary.voted_time = now;
        }
        self.push_deferred(DeferredAction::FsyncTable);
        info!(%requester, epoch = self.current_epoch, "granting election vote");
        let grant = self.outbound(
            Destination::Reply(link),
            MessageKind::VoteGrant,
            Payload::Empty,
        );
        sends.push(grant);
    }

    /// Replica side: count a grant and promote on quorum.
    pub(crate) fn handle_vote_grant(&mut self, msg: &Message, sends: &mut Vec<Outbound>) {
        if self.failover.phase != FailoverPhase::RequestingVotes {
            return;
        }
        let hdr = &msg.header;
        let voter_counts = self
            .nodes
            .get(&hdr.sender)
            .map(|n| n.role == NodeRole::Primary && n.slot_count() > 0)
            .unwrap_or(false);
        if !voter_counts || hdr.current_epoch < self.failover.epoch {
            return;
        }

        self.failover.votes.insert(hdr.sender);
        let votes = self.failover.votes.len();
        let quorum = self.seen_cluster_size / 2 + 1;
        debug!(votes, quorum, "vote received");
        if votes >= quorum {
            self.failover_win(sends);
        }
    }

    /// Quorum reached: take over the old primary's slots and announce.
    fn failover_win(&mut self, sends: &mut Vec<Outbound>) {
        let epoch = self.failover.epoch;
        let Some(old_primary) = self.myself().primary else {
            return;
        };
        info!(epoch, %old_primary, "election won, promoting to primary");

        self.set_node_primary(self.myself_id, None);
        let inherited: Vec<u16> = self
            .nodes
            .get(&old_primary)
            .map(|n| n.slots.iter().collect())
            .unwrap_or_default();
        for slot in inherited {
            self.assign_slot(slot, Some(self.myself_id));
        }
        self.myself_mut().config_epoch = epoch;

        self.failover.reset();
        self.failover.retry_after = 0;
        self.reset_manual_failover();
        self.emit(ClusterEvent::PromotedToPrimary { epoch });
        self.push_deferred(DeferredAction::FsyncTable);
        self.push_deferred(DeferredAction::RecomputeState);

        // everyone learns the new ownership through an immediate heartbeat
        let pong = self.outbound(
            Destination::Broadcast,
            MessageKind::Pong,
            Payload::Heartbeat(Vec::new()),
        );
        sends.push(pong);
    }
}
