//! The single-threaded event loop owning the cluster state.
//!
//! One task owns the `Cluster`; everything else (link readers/writers,
//! admin connections, outbound dials) is a dumb pipe feeding it over
//! channels. Deferred side effects (verdict recompute, node table
//! persistence) are drained exactly once per loop iteration, after
//! whichever branch ran.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use keel_cluster::{
    format_table, Cluster, ClusterEvent, LinkId, NodeId, NodeTableFile, Outbound, TickActions,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::admin::{handle_admin_conn, AdminCall};
use crate::link::{read_loop, write_loop, LinkHandle, LinkInput};

pub struct Server {
    cluster: Cluster,
    table: NodeTableFile,
    host: IpAddr,
    port: u16,
    admin_port: u16,
    links: HashMap<LinkId, LinkHandle>,
    next_link: u64,
    /// Outbound dials in flight, so one slow connect is not retried every
    /// tick.
    connecting: HashSet<NodeId>,
    inbox_tx: UnboundedSender<LinkInput>,
    inbox_rx: UnboundedReceiver<LinkInput>,
    admin_tx: UnboundedSender<AdminCall>,
    admin_rx: UnboundedReceiver<AdminCall>,
    events_rx: UnboundedReceiver<ClusterEvent>,
}

impl Server {
    pub fn new(
        cluster: Cluster,
        table: NodeTableFile,
        host: IpAddr,
        port: u16,
        admin_port: u16,
        events_rx: UnboundedReceiver<ClusterEvent>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();
        Self {
            cluster,
            table,
            host,
            port,
            admin_port,
            links: HashMap::new(),
            next_link: 1,
            connecting: HashSet::new(),
            inbox_tx,
            inbox_rx,
            admin_tx,
            admin_rx,
            events_rx,
        }
    }

    pub async fn run(mut self) -> io::Result<()> {
        let bus = TcpListener::bind((self.host, self.port)).await?;
        let admin = TcpListener::bind((self.host, self.admin_port)).await?;
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.cluster.config().tick_interval_ms,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let actions = self.cluster.tick();
                    self.apply_tick(actions);
                }
                accepted = bus.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let link = self.register_link(stream, peer.ip());
                            debug!(?link, %peer, "inbound bus connection");
                        }
                        Err(err) => warn!(%err, "bus accept failed"),
                    }
                }
                accepted = admin.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "admin connection");
                            tokio::spawn(handle_admin_conn(stream, self.admin_tx.clone()));
                        }
                        Err(err) => warn!(%err, "admin accept failed"),
                    }
                }
                Some(input) = self.inbox_rx.recv() => {
                    self.on_link_input(input);
                }
                Some((request, reply)) = self.admin_rx.recv() => {
                    self.on_admin(request, reply);
                }
                Some(event) = self.events_rx.recv() => {
                    on_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }

            self.commit()?;
        }
    }

    /// Dials and transmits whatever the tick asked for.
    fn apply_tick(&mut self, actions: TickActions) {
        for request in actions.connects {
            if self.connecting.contains(&request.node) {
                continue;
            }
            self.connecting.insert(request.node);
            let inbox = self.inbox_tx.clone();
            let node = request.node;
            let addr = request.addr;
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    Duration::from_secs(5),
                    TcpStream::connect(addr),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                });
                let _ = inbox.send(LinkInput::Connected { node, result });
            });
        }
        for outbound in actions.sends {
            self.transmit(outbound);
        }
    }

    /// Encodes once and fans out to every link the destination resolves to.
    fn transmit(&mut self, outbound: Outbound) {
        let bytes = outbound.message.encode();
        for link in self.cluster.resolve_destination(outbound.dest) {
            if let Some(handle) = self.links.get(&link) {
                let _ = handle.out_tx.send(bytes.clone());
            }
        }
    }

    fn on_link_input(&mut self, input: LinkInput) {
        match input {
            LinkInput::Connected { node, result } => {
                self.connecting.remove(&node);
                match result {
                    Ok(stream) => {
                        let remote_ip = stream
                            .peer_addr()
                            .map(|a| a.ip())
                            .unwrap_or(self.host);
                        let link = self.register_link(stream, remote_ip);
                        if let Some(handshake) = self.cluster.link_established(node, link) {
                            self.transmit(handshake);
                        }
                    }
                    Err(err) => {
                        // non-fatal by design: the next tick retries
                        debug!(%node, %err, "outbound connect failed");
                    }
                }
            }
            LinkInput::Message {
                link,
                remote_ip,
                message,
            } => {
                let outcome = self.cluster.handle_message(link, remote_ip, message);
                for outbound in outcome.sends {
                    self.transmit(outbound);
                }
                if outcome.close_link {
                    self.close_link(link);
                }
            }
            LinkInput::Closed { link } => {
                self.cluster.link_closed(link);
                self.links.remove(&link);
            }
        }
    }

    fn on_admin(&mut self, request: keel_cluster::AdminRequest, reply: oneshot::Sender<String>) {
        let rendered = match self.cluster.admin(request) {
            Ok((admin_reply, sends)) => {
                for outbound in sends {
                    self.transmit(outbound);
                }
                crate::admin::render_reply(&admin_reply)
            }
            Err(err) => format!("-ERR {err}"),
        };
        let _ = reply.send(rendered);
    }

    fn register_link(&mut self, stream: TcpStream, remote_ip: IpAddr) -> LinkId {
        let _ = stream.set_nodelay(true);
        let link = LinkId(self.next_link);
        self.next_link += 1;

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(out_rx, write_half));
        tokio::spawn(read_loop(link, remote_ip, read_half, self.inbox_tx.clone()));

        self.links.insert(link, LinkHandle { out_tx });
        link
    }

    fn close_link(&mut self, link: LinkId) {
        // dropping the handle closes the outbound queue; the writer task
        // exits and the socket follows
        self.links.remove(&link);
        self.cluster.link_closed(link);
    }

    /// End-of-iteration housekeeping: tear down links the registry
    /// released and persist the node table if any handler asked for it.
    fn commit(&mut self) -> io::Result<()> {
        for link in self.cluster.take_dead_links() {
            self.links.remove(&link);
        }
        if let Some(save) = self.cluster.flush_deferred() {
            let contents = format_table(&self.cluster);
            if let Err(err) = self.table.save(&contents, save.fsync) {
                // an unsynced membership table risks split-brain on the
                // next start; dying loudly is the safe option
                error!(%err, "node table persistence failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Host-side reactions to cluster notifications. The storage engine,
/// dispatcher and replication stream are external; from here they are log
/// lines marking the integration points.
fn on_event(event: ClusterEvent) {
    match event {
        ClusterEvent::VerdictChanged(verdict) => info!(%verdict, "cluster verdict changed"),
        ClusterEvent::NodeAdded(id) => debug!(%id, "node added"),
        ClusterEvent::NodeRemoved(id) => debug!(%id, "node removed"),
        ClusterEvent::NodeFailed(id) => warn!(%id, "node confirmed down"),
        ClusterEvent::NodeRecovered(id) => info!(%id, "node recovered"),
        ClusterEvent::PromotedToPrimary { epoch } => {
            info!(epoch, "promoted to primary; replication role change is due")
        }
        ClusterEvent::DemotedToReplica { primary } => {
            info!(%primary, "now replicating; storage must resync from the primary")
        }
        ClusterEvent::SlotsOrphaned(slots) => {
            info!(count = slots.len(), "slots lost with local keys; storage must purge them")
        }
        ClusterEvent::PauseWrites { deadline_ms } => {
            info!(deadline_ms, "pausing client writes for manual failover")
        }
        ClusterEvent::ResumeWrites => info!("resuming client writes"),
        ClusterEvent::Publish { channel, payload } => {
            debug!(channel = ?channel, bytes = payload.len(), "pub/sub relay received")
        }
    }
}
