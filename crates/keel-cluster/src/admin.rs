//! Administrative command surface.
//!
//! A transport-free request/response API: the server front end (or a test)
//! builds an [`AdminRequest`], the cluster answers with an [`AdminReply`]
//! plus any wire messages the operation produced. Misuse is rejected
//! synchronously with a descriptive reason; nothing here is ever applied
//! halfway.

use std::net::IpAddr;

use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::cluster::{Cluster, DeferredAction, Destination, Outbound};
use crate::error::ClusterError;
use crate::health::ClusterVerdict;
use crate::message::{MessageKind, Payload};
use crate::node::{Node, NodeId, NodeRole};
use crate::persistence::format_node_line;
use crate::slots::SLOT_COUNT;

/// One admin operation.
#[derive(Debug, Clone)]
pub enum AdminRequest {
    /// Start a handshake toward a new peer.
    Meet { ip: IpAddr, port: u16 },
    /// One formatted line per known node.
    Peers,
    MyId,
    /// Verdict, coverage, size, epochs and message counters.
    Info,
    AddSlots(Vec<u16>),
    DelSlots(Vec<u16>),
    SetSlotMigrating { slot: u16, dest: NodeId },
    SetSlotImporting { slot: u16, src: NodeId },
    SetSlotStable { slot: u16 },
    SetSlotOwner { slot: u16, owner: NodeId },
    /// Blacklist and remove a node.
    Forget { id: NodeId },
    /// Become a replica of the given primary.
    Replicate { primary: NodeId },
    /// Trigger a manual failover on this replica.
    Failover { force: bool },
    /// Bootstrap-only epoch override.
    SetEpoch { epoch: u64 },
    Reset { hard: bool },
    /// Relay a pub/sub message cluster-wide.
    Publish { channel: Bytes, payload: Bytes },
}

/// Successful admin responses.
#[derive(Debug, Clone)]
pub enum AdminReply {
    Ok,
    MyId(NodeId),
    Peers(Vec<String>),
    Info(ClusterInfo),
}

/// The `describe-state` snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub verdict: ClusterVerdict,
    pub slots_assigned: usize,
    pub slots_ok: usize,
    pub slots_pfail: usize,
    pub slots_fail: usize,
    pub known_nodes: usize,
    pub cluster_size: usize,
    pub current_epoch: u64,
    pub my_epoch: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl std::fmt::Display for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cluster_state:{}", self.verdict)?;
        writeln!(f, "cluster_slots_assigned:{}", self.slots_assigned)?;
        writeln!(f, "cluster_slots_ok:{}", self.slots_ok)?;
        writeln!(f, "cluster_slots_pfail:{}", self.slots_pfail)?;
        writeln!(f, "cluster_slots_fail:{}", self.slots_fail)?;
        writeln!(f, "cluster_known_nodes:{}", self.known_nodes)?;
        writeln!(f, "cluster_size:{}", self.cluster_size)?;
        writeln!(f, "cluster_current_epoch:{}", self.current_epoch)?;
        writeln!(f, "cluster_my_epoch:{}", self.my_epoch)?;
        writeln!(f, "cluster_messages_sent:{}", self.messages_sent)?;
        write!(f, "cluster_messages_received:{}", self.messages_received)
    }
}

fn misuse(msg: impl Into<String>) -> ClusterError {
    ClusterError::AdminMisuse(msg.into())
}

fn check_slot(slot: u16) -> Result<(), ClusterError> {
    if slot >= SLOT_COUNT {
        return Err(misuse(format!("slot {slot} out of range")));
    }
    Ok(())
}

impl Cluster {
    /// Executes one admin request.
    pub fn admin(
        &mut self,
        request: AdminRequest,
    ) -> Result<(AdminReply, Vec<Outbound>), ClusterError> {
        let mut sends = Vec::new();
        let reply = match request {
            AdminRequest::Meet { ip, port } => {
                if self
                    .nodes
                    .values()
                    .any(|n| n.ip == Some(ip) && n.port == port)
                {
                    return Err(misuse(format!("{ip}:{port} is already known")));
                }
                info!(%ip, port, "admin meet");
                let _ = self.add_node(Node::handshake(ip, port));
                AdminReply::Ok
            }

            AdminRequest::Peers => {
                let mut nodes: Vec<&Node> = self.nodes().collect();
                nodes.sort_by_key(|n| n.id);
                let lines = nodes
                    .iter()
                    .map(|n| format_node_line(self, n))
                    .collect();
                AdminReply::Peers(lines)
            }

            AdminRequest::MyId => AdminReply::MyId(self.myself_id()),

            AdminRequest::Info => AdminReply::Info(self.cluster_info()),

            AdminRequest::AddSlots(slots) => {
                if self.myself().role != NodeRole::Primary {
                    return Err(misuse("a replica cannot own slots"));
                }
                for &slot in &slots {
                    check_slot(slot)?;
                    if let Some(owner) = self.slot_owner(slot) {
                        return Err(misuse(format!(
                            "slot {slot} is already owned by {owner}"
                        )));
                    }
                }
                for &slot in &slots {
                    self.assign_slot(slot, Some(self.myself_id));
                }
                self.push_deferred(DeferredAction::RecomputeState);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::DelSlots(slots) => {
                for &slot in &slots {
                    check_slot(slot)?;
                    if self.slot_owner(slot) != Some(self.myself_id) {
                        return Err(misuse(format!("slot {slot} is not owned locally")));
                    }
                }
                for &slot in &slots {
                    self.assign_slot(slot, None);
                    self.migrating_to.remove(&slot);
                    self.importing_from.remove(&slot);
                }
                self.push_deferred(DeferredAction::RecomputeState);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::SetSlotMigrating { slot, dest } => {
                check_slot(slot)?;
                if self.slot_owner(slot) != Some(self.myself_id) {
                    return Err(misuse(format!(
                        "cannot migrate slot {slot}: not owned locally"
                    )));
                }
                let node = self
                    .node(&dest)
                    .ok_or(ClusterError::NodeNotFound(dest))?;
                if node.role != NodeRole::Primary || dest == self.myself_id {
                    return Err(misuse("migration destination must be another primary"));
                }
                self.migrating_to.insert(slot, dest);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::SetSlotImporting { slot, src } => {
                check_slot(slot)?;
                if self.slot_owner(slot) == Some(self.myself_id) {
                    return Err(misuse(format!(
                        "cannot import slot {slot}: already owned locally"
                    )));
                }
                if self.slot_owner(slot) != Some(src) {
                    return Err(misuse(format!("slot {slot} is not owned by {src}")));
                }
                self.importing_from.insert(slot, src);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::SetSlotStable { slot } => {
                check_slot(slot)?;
                self.migrating_to.remove(&slot);
                self.importing_from.remove(&slot);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::SetSlotOwner { slot, owner } => {
                check_slot(slot)?;
                if self.node(&owner).is_none() {
                    return Err(ClusterError::NodeNotFound(owner));
                }
                // finishing an import: the new owner claims a fresh epoch so
                // the change beats the old owner's announcements
                if owner == self.myself_id && self.importing_from.remove(&slot).is_some() {
                    self.current_epoch += 1;
                    let epoch = self.current_epoch;
                    self.myself_mut().config_epoch = epoch;
                    info!(slot, epoch, "import finished, claiming slot under a new epoch");
                }
                if self.migrating_to.remove(&slot).is_some() {
                    info!(slot, owner = %owner, "migration finished, releasing slot");
                }
                self.assign_slot(slot, Some(owner));
                self.push_deferred(DeferredAction::RecomputeState);
                self.push_deferred(DeferredAction::FsyncTable);
                AdminReply::Ok
            }

            AdminRequest::Forget { id } => {
                if id == self.myself_id {
                    return Err(misuse("cannot forget myself"));
                }
                if self.myself().primary == Some(id) {
                    return Err(misuse("cannot forget my own primary"));
                }
                if self.node(&id).is_none() {
                    return Err(ClusterError::NodeNotFound(id));
                }
                self.blacklist.add(id);
                self.remove_node(id);
                AdminReply::Ok
            }

            AdminRequest::Replicate { primary } => {
                if primary == self.myself_id {
                    return Err(misuse("cannot replicate myself"));
                }
                let target = self
                    .node(&primary)
                    .ok_or(ClusterError::NodeNotFound(primary))?;
                if target.role != NodeRole::Primary {
                    return Err(misuse(format!("{primary} is not a primary")));
                }
                if self.myself().slot_count() > 0 {
                    return Err(misuse(
                        "cannot become a replica while holding slots; unassign them first",
                    ));
                }
                info!(%primary, "becoming a replica by admin request");
                self.set_node_primary(self.myself_id, Some(primary));
                self.push_deferred(DeferredAction::RecomputeState);
                self.push_deferred(DeferredAction::SaveTable);
                AdminReply::Ok
            }

            AdminRequest::Failover { force } => {
                if let Some(out) = self.start_manual_failover(force)? {
                    sends.push(out);
                }
                AdminReply::Ok
            }

            AdminRequest::SetEpoch { epoch } => {
                if self.known_nodes() > 1 {
                    return Err(misuse(
                        "set-epoch is bootstrap-only: other nodes are already known",
                    ));
                }
                if self.current_epoch != 0 {
                    return Err(misuse("set-epoch requires a zero epoch"));
                }
                self.current_epoch = epoch;
                self.myself_mut().config_epoch = epoch;
                self.push_deferred(DeferredAction::FsyncTable);
                AdminReply::Ok
            }

            AdminRequest::Reset { hard } => {
                self.reset(hard);
                AdminReply::Ok
            }

            AdminRequest::Publish { channel, payload } => {
                let msg = self.outbound(
                    Destination::Broadcast,
                    MessageKind::Publish,
                    Payload::Publish { channel, payload },
                );
                sends.push(msg);
                AdminReply::Ok
            }
        };
        Ok((reply, sends))
    }

    fn cluster_info(&self) -> ClusterInfo {
        let mut assigned = 0usize;
        let mut ok = 0usize;
        let mut pfail = 0usize;
        let mut fail = 0usize;
        for slot in 0..SLOT_COUNT {
            let Some(owner) = self.slot_owner(slot) else {
                continue;
            };
            assigned += 1;
            match self.node(&owner) {
                Some(n) if n.flags.fail => fail += 1,
                Some(n) if n.flags.pfail => pfail += 1,
                Some(_) => ok += 1,
                None => fail += 1,
            }
        }
        ClusterInfo {
            verdict: self.verdict(),
            slots_assigned: assigned,
            slots_ok: ok,
            slots_pfail: pfail,
            slots_fail: fail,
            known_nodes: self.known_nodes(),
            cluster_size: self.seen_cluster_size,
            current_epoch: self.current_epoch(),
            my_epoch: self.myself().config_epoch,
            messages_sent: self.stats().total_sent(),
            messages_received: self.stats().total_received(),
        }
    }

    /// Soft reset drops every peer and all ownership; hard reset also
    /// zeroes the epochs and assumes a brand-new identity.
    fn reset(&mut self, hard: bool) {
        info!(hard, "cluster reset");
        let others: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| *id != self.myself_id)
            .collect();
        for id in others {
            self.remove_node(id);
        }
        for slot in 0..SLOT_COUNT {
            self.assign_slot(slot, None);
        }
        self.migrating_to.clear();
        self.importing_from.clear();
        self.set_node_primary(self.myself_id, None);
        self.failover = Default::default();
        self.reset_manual_failover();

        if hard {
            self.current_epoch = 0;
            self.last_vote_epoch = 0;
            let new_id = NodeId::random();
            let old_id = self.myself_id;
            self.rename_node(old_id, new_id);
            self.myself_id = new_id;
            self.myself_mut().config_epoch = 0;
            info!(%new_id, "assumed a new identity");
        }
        self.push_deferred(DeferredAction::RecomputeState);
        self.push_deferred(DeferredAction::FsyncTable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{add_peer, cluster};

    fn ok(cluster: &mut Cluster, req: AdminRequest) -> AdminReply {
        cluster.admin(req).expect("admin request should succeed").0
    }

    #[test]
    fn meet_creates_handshake_node() {
        let (mut c, _rx) = cluster(7000);
        ok(
            &mut c,
            AdminRequest::Meet {
                ip: "10.0.0.2".parse().unwrap(),
                port: 7001,
            },
        );
        assert!(c.nodes().any(|n| n.flags.handshake && n.flags.meet));

        // meeting the same address twice is refused
        let err = c
            .admin(AdminRequest::Meet {
                ip: "10.0.0.2".parse().unwrap(),
                port: 7001,
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::AdminMisuse(_)));
    }

    #[test]
    fn addslots_and_delslots() {
        let (mut c, _rx) = cluster(7000);
        ok(&mut c, AdminRequest::AddSlots(vec![1, 2, 3]));
        assert_eq!(c.slot_owner(2), Some(c.myself_id()));

        // double assignment refused atomically
        let err = c.admin(AdminRequest::AddSlots(vec![4, 2])).unwrap_err();
        assert!(matches!(err, ClusterError::AdminMisuse(_)));
        assert_eq!(c.slot_owner(4), None, "nothing partially applied");

        ok(&mut c, AdminRequest::DelSlots(vec![1, 2, 3]));
        assert_eq!(c.slot_owner(2), None);
    }

    #[test]
    fn replica_cannot_add_slots() {
        let (mut c, _rx) = cluster(7000);
        let primary = add_peer(&mut c, 7001, NodeRole::Primary);
        let me = c.myself_id();
        c.set_node_primary(me, Some(primary));
        assert!(c.admin(AdminRequest::AddSlots(vec![1])).is_err());
    }

    #[test]
    fn setslot_migration_cycle() {
        let (mut c, _rx) = cluster(7000);
        let dest = add_peer(&mut c, 7001, NodeRole::Primary);
        ok(&mut c, AdminRequest::AddSlots(vec![500]));

        ok(
            &mut c,
            AdminRequest::SetSlotMigrating { slot: 500, dest },
        );
        assert_eq!(c.migrating_to.get(&500), Some(&dest));

        // handing the slot over clears the intent
        ok(
            &mut c,
            AdminRequest::SetSlotOwner {
                slot: 500,
                owner: dest,
            },
        );
        assert!(c.migrating_to.is_empty());
        assert_eq!(c.slot_owner(500), Some(dest));
    }

    #[test]
    fn setslot_importing_requires_foreign_owner() {
        let (mut c, _rx) = cluster(7000);
        let src = add_peer(&mut c, 7001, NodeRole::Primary);
        c.assign_slot(500, Some(src));

        ok(&mut c, AdminRequest::SetSlotImporting { slot: 500, src });
        assert_eq!(c.importing_from.get(&500), Some(&src));

        // owning the slot already is a misuse
        c.assign_slot(501, Some(c.myself_id()));
        assert!(c
            .admin(AdminRequest::SetSlotImporting { slot: 501, src })
            .is_err());
    }

    #[test]
    fn finishing_import_bumps_epoch() {
        let (mut c, _rx) = cluster(7000);
        let src = add_peer(&mut c, 7001, NodeRole::Primary);
        c.assign_slot(500, Some(src));
        ok(&mut c, AdminRequest::SetSlotImporting { slot: 500, src });

        let epoch_before = c.current_epoch();
        let me = c.myself_id();
        ok(
            &mut c,
            AdminRequest::SetSlotOwner {
                slot: 500,
                owner: me,
            },
        );
        assert_eq!(c.current_epoch(), epoch_before + 1);
        assert_eq!(c.myself().config_epoch, epoch_before + 1);
        assert!(c.importing_from.is_empty());
        assert_eq!(c.slot_owner(500), Some(me));
    }

    #[test]
    fn forget_blacklists_and_removes() {
        let (mut c, _rx) = cluster(7000);
        let peer = add_peer(&mut c, 7001, NodeRole::Primary);
        ok(&mut c, AdminRequest::Forget { id: peer });
        assert!(c.node(&peer).is_none());
        assert!(c.blacklist.contains(&peer));

        let me = c.myself_id();
        assert!(c.admin(AdminRequest::Forget { id: me }).is_err());
    }

    #[test]
    fn forget_own_primary_rejected() {
        let (mut c, _rx) = cluster(7000);
        let primary = add_peer(&mut c, 7001, NodeRole::Primary);
        let me = c.myself_id();
        c.set_node_primary(me, Some(primary));
        assert!(c.admin(AdminRequest::Forget { id: primary }).is_err());
    }

    #[test]
    fn replicate_rejected_while_holding_slots() {
        let (mut c, _rx) = cluster(7000);
        let primary = add_peer(&mut c, 7001, NodeRole::Primary);
        ok(&mut c, AdminRequest::AddSlots(vec![1]));
        let err = c
            .admin(AdminRequest::Replicate { primary })
            .unwrap_err();
        assert!(matches!(err, ClusterError::AdminMisuse(_)));

        ok(&mut c, AdminRequest::DelSlots(vec![1]));
        ok(&mut c, AdminRequest::Replicate { primary });
        assert_eq!(c.myself().role, NodeRole::Replica);
        assert_eq!(c.myself().primary, Some(primary));
    }

    #[test]
    fn set_epoch_bootstrap_only() {
        let (mut c, _rx) = cluster(7000);
        ok(&mut c, AdminRequest::SetEpoch { epoch: 42 });
        assert_eq!(c.current_epoch(), 42);

        // a second call is no longer at epoch zero
        assert!(c.admin(AdminRequest::SetEpoch { epoch: 43 }).is_err());

        let (mut c2, _rx2) = cluster(7000);
        add_peer(&mut c2, 7001, NodeRole::Primary);
        assert!(c2.admin(AdminRequest::SetEpoch { epoch: 1 }).is_err());
    }

    #[test]
    fn soft_and_hard_reset() {
        let (mut c, _rx) = cluster(7000);
        let id_before = c.myself_id();
        add_peer(&mut c, 7001, NodeRole::Primary);
        ok(&mut c, AdminRequest::AddSlots(vec![1, 2]));
        c.current_epoch = 9;

        ok(&mut c, AdminRequest::Reset { hard: false });
        assert_eq!(c.known_nodes(), 1);
        assert_eq!(c.assigned_slots(), 0);
        assert_eq!(c.current_epoch(), 9, "soft reset keeps epochs");
        assert_eq!(c.myself_id(), id_before);

        ok(&mut c, AdminRequest::Reset { hard: true });
        assert_eq!(c.current_epoch(), 0);
        assert_ne!(c.myself_id(), id_before, "hard reset assumes a new identity");
    }

    #[test]
    fn info_reports_counters() {
        let (mut c, _rx) = cluster(7000);
        ok(&mut c, AdminRequest::AddSlots(vec![0, 1]));
        c.flush_deferred();

        let AdminReply::Info(info) = ok(&mut c, AdminRequest::Info) else {
            panic!("expected info reply");
        };
        assert_eq!(info.slots_assigned, 2);
        assert_eq!(info.slots_ok, 2);
        assert_eq!(info.known_nodes, 1);
        let rendered = info.to_string();
        assert!(rendered.contains("cluster_slots_assigned:2"));
    }

    #[test]
    fn publish_broadcasts() {
        let (mut c, _rx) = cluster(7000);
        let (_, sends) = c
            .admin(AdminRequest::Publish {
                channel: Bytes::from_static(b"ch"),
                payload: Bytes::from_static(b"hello"),
            })
            .unwrap();
        assert_eq!(sends.len(), 1);
        assert!(matches!(
            sends[0].message.payload,
            Payload::Publish { .. }
        ));
        assert_eq!(sends[0].dest, Destination::Broadcast);
    }
}
