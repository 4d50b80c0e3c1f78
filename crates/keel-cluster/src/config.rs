//! Cluster protocol configuration.

/// Tunables for the membership and failover protocol.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How long without a heartbeat reply before a peer is privately
    /// suspected unreachable.
    pub node_timeout_ms: u64,
    /// Period of the coordination tick driving gossip, failure detection,
    /// failover and state evaluation.
    pub tick_interval_ms: u64,
    /// How long a forgotten node stays on the blacklist, so gossip from
    /// peers that have not heard the removal cannot resurrect it.
    pub blacklist_ttl_ms: u64,
    /// Maximum number of third-party facts embedded in a heartbeat.
    pub gossip_facts: usize,
    /// Number of random candidates sampled when choosing which peer to probe.
    pub probe_sample: usize,
    /// Fixed delay before a replica starts requesting election votes.
    pub failover_base_delay_ms: u64,
    /// Additional delay per replica that holds a newer replication offset.
    pub failover_rank_delay_ms: u64,
    /// A replica only starts an automatic election if its replication link
    /// was active within `node_timeout * replica_validity_factor`.
    pub replica_validity_factor: u64,
    /// Minimum number of working replicas a primary must keep before one of
    /// them may re-parent to an orphaned primary.
    pub migration_barrier: usize,
    /// Hard wall-clock limit on a manual failover attempt.
    pub manual_failover_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 15_000,
            tick_interval_ms: 100,
            blacklist_ttl_ms: 60_000,
            gossip_facts: 3,
            probe_sample: 5,
            failover_base_delay_ms: 500,
            failover_rank_delay_ms: 1000,
            replica_validity_factor: 10,
            migration_barrier: 1,
            manual_failover_timeout_ms: 5000,
        }
    }
}

impl ClusterConfig {
    /// Handshakes that do not complete within this window are garbage
    /// collected.
    pub fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout_ms.max(1000)
    }

    /// How long an election waits for votes before giving up.
    pub fn election_timeout_ms(&self) -> u64 {
        (self.node_timeout_ms * 2).max(2000)
    }

    /// Cooldown between abandoned election attempts.
    pub fn election_retry_ms(&self) -> u64 {
        self.election_timeout_ms() * 2
    }

    /// Failure reports older than this no longer count toward quorum.
    pub fn fail_report_validity_ms(&self) -> u64 {
        self.node_timeout_ms * 2
    }

    /// A confirmed-down primary that still owns slots is only cleared after
    /// this much time without anyone taking its slots over.
    pub fn fail_undo_ms(&self) -> u64 {
        self.node_timeout_ms * 2
    }

    /// Grace window before a primary rejoining from a minority partition
    /// starts serving again.
    pub fn rejoin_delay_ms(&self) -> u64 {
        self.node_timeout_ms.clamp(500, 5000)
    }

    /// Minimum interval between two votes for replicas of the same primary.
    pub fn vote_interval_ms(&self) -> u64 {
        self.node_timeout_ms * 2
    }
}
