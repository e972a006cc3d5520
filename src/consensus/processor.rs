//! The per-node actor.
//!
//! One task per node owns the ordering engine and the key-sharing state and
//! processes, one at a time, envelopes from the network, commands from the
//! host and timer ticks. Outbound sends are spawned so a handler never waits
//! on the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::bootstrap::KeySharing;
use super::engine::{ConflictEvidence, NodeState, OrderingEngine, Output};
use super::message::{ClientMessage, KeyAnnounce, Message, NodeName, PeerMessage};
use super::peers::{PeerKeyRegistry, Pool};
use super::store::{KeyStore, OrderedRequestRecord};
use crate::config::client_endpoint;
use crate::network::{Envelope, Inbox, Transport};

/// What the host can observe about a node without asking it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub view: u64,
    pub primary: NodeName,
    pub last_executed: u64,
}

impl NodeStatus {
    fn of(engine: &OrderingEngine) -> Self {
        NodeStatus {
            state: engine.state(),
            view: engine.view(),
            primary: engine.primary().to_string(),
            last_executed: engine.last_executed(),
        }
    }
}

/// A point-in-time copy of a node's ledger and evidence.
#[derive(Clone, Debug, Serialize)]
pub struct NodeSnapshot {
    pub status: NodeStatus,
    pub records: Vec<OrderedRequestRecord>,
    pub peer_keys: PeerKeyRegistry,
    pub evidence: Vec<ConflictEvidence>,
}

#[derive(Debug)]
pub enum Command {
    StartKeySharing,
    Inspect(oneshot::Sender<NodeSnapshot>),
    Shutdown,
}

/// Tracks when each peer was last heard from and warns when fewer than
/// `n - f` members look alive.
#[derive(Debug)]
pub struct LivenessMonitor {
    me: NodeName,
    peers: Vec<NodeName>,
    last_heard: HashMap<NodeName, Instant>,
    window: Duration,
    quorum: usize,
    degraded: bool,
}

impl LivenessMonitor {
    pub fn new(pool: &Pool, me: &str, window: Duration) -> Self {
        LivenessMonitor {
            me: me.to_string(),
            peers: pool.others(me).cloned().collect(),
            last_heard: HashMap::new(),
            window,
            quorum: pool.live_quorum(),
            degraded: false,
        }
    }

    pub fn heard(&mut self, peer: &str, now: Instant) {
        if let Some(last) = self.last_heard.get_mut(peer) {
            *last = now;
        } else if self.peers.iter().any(|name| name == peer) {
            self.last_heard.insert(peer.to_string(), now);
        }
    }

    /// Live members, ourselves included.
    pub fn live(&self, now: Instant) -> usize {
        1 + self
            .last_heard
            .values()
            .filter(|last| now.duration_since(**last) <= self.window)
            .count()
    }

    /// Logs on transitions only. Returns whether the pool looks degraded.
    pub fn check(&mut self, now: Instant) -> bool {
        let live = self.live(now);
        let degraded = live < self.quorum;
        if degraded && !self.degraded {
            tracing::warn!(node = %self.me, live, required = self.quorum, "too few live nodes, ordering may stall");
        } else if !degraded && self.degraded {
            tracing::info!(node = %self.me, live, "liveness restored");
        }
        self.degraded = degraded;
        degraded
    }
}

pub struct ConsensusProcessor {
    engine: OrderingEngine,
    key_sharing: KeySharing,
    key_store: KeyStore,
    liveness: LivenessMonitor,
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<NodeStatus>,
    tick_interval: Duration,
    started_at: Instant,
}

impl ConsensusProcessor {
    pub fn new(
        engine: OrderingEngine,
        key_store: KeyStore,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, watch::Receiver<NodeStatus>) {
        let config = engine.config.clone();
        let key_sharing = KeySharing::new(engine.pool(), engine.name(), &config);
        let liveness = LivenessMonitor::new(engine.pool(), engine.name(), config.liveness_window());
        let (status, status_rx) = watch::channel(NodeStatus::of(&engine));
        let processor = ConsensusProcessor {
            engine,
            key_sharing,
            key_store,
            liveness,
            transport,
            inbox,
            commands,
            status,
            tick_interval: config.tick_interval(),
            started_at: Instant::now(),
        };
        (processor, status_rx)
    }

    pub async fn run(mut self) {
        tracing::info!(node = %self.engine.name(), "node started");
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope),
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(Command::StartKeySharing) => self.start_key_sharing(),
                    Some(Command::Inspect(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.publish_status();
        }
        tracing::info!(node = %self.engine.name(), "node stopped");
    }

    fn start_key_sharing(&mut self) {
        let now = Instant::now();
        if !self.key_sharing.start(now) {
            tracing::debug!(node = %self.engine.name(), "key sharing already running");
            return;
        }
        self.started_at = now;
        self.engine.start_bootstrap();
        tracing::info!(node = %self.engine.name(), peers = self.engine.pool().n() - 1, "key sharing started");
        self.announce(now);
        self.check_bootstrap(now);
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        let now = Instant::now();
        match envelope.message {
            Message::Peer(message) => {
                let author = message.author().to_string();
                if !self.engine.pool().is_member(&author) {
                    tracing::warn!(node = %self.engine.name(), from = %envelope.from, "message from outside the pool");
                    return;
                }
                self.liveness.heard(&author, now);
                tracing::trace!(node = %self.engine.name(), from = %author, kind = message.kind(), "peer message");
                match message {
                    PeerMessage::KeyAnnounce(announce) => self.on_key_announce(announce, false, now),
                    PeerMessage::KeyAck(announce) => self.on_key_announce(announce, true, now),
                    message => {
                        let outputs = self.engine.on_peer_message(message, now);
                        self.dispatch(outputs);
                    }
                }
            }
            Message::Client(ClientMessage::SubmitRequest(request)) => {
                let (client, req_id) = (request.client_id.clone(), request.req_id);
                match self.engine.on_request(request, now) {
                    Ok(outputs) => self.dispatch(outputs),
                    Err(err) => {
                        tracing::warn!(node = %self.engine.name(), %client, req_id, error = %err, "request rejected");
                    }
                }
            }
            Message::Client(ClientMessage::Reply(_)) => {
                tracing::debug!(node = %self.engine.name(), from = %envelope.from, "ignoring reply sent to a node");
            }
        }
    }

    fn on_key_announce(&mut self, announce: KeyAnnounce, is_ack: bool, now: Instant) {
        let peer = announce.node_name.clone();
        match self
            .key_sharing
            .on_announce(self.engine.peer_keys_mut(), &announce, is_ack)
        {
            Ok(true) => {
                if let Err(err) = self.key_store.save_peer_keys(&self.engine.identity().peer_keys) {
                    tracing::error!(node = %self.engine.name(), error = %err, "failed to persist peer keys");
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(node = %self.engine.name(), %peer, error = %err, "key announcement rejected");
                return;
            }
        }

        if !is_ack {
            let keypair = &self.engine.identity().keypair;
            let ack = KeyAnnounce::new(keypair, self.engine.name(), true);
            let reannounce = self
                .key_sharing
                .should_announce_to(&peer)
                .then(|| KeyAnnounce::new(keypair, self.engine.name(), false));
            self.send(peer.clone(), Message::Peer(PeerMessage::KeyAck(ack)), self.engine.name().to_string());
            if let Some(announce) = reannounce {
                tracing::debug!(node = %self.engine.name(), %peer, "announcing key to unacknowledged peer");
                self.send(peer, Message::Peer(PeerMessage::KeyAnnounce(announce)), self.engine.name().to_string());
            }
        }
        self.check_bootstrap(now);
    }

    fn check_bootstrap(&mut self, now: Instant) {
        if self.engine.state() != NodeState::Bootstrapping
            || !self.key_sharing.is_complete(&self.engine.identity().peer_keys)
        {
            return;
        }
        tracing::info!(
            node = %self.engine.name(),
            elapsed_ms = now.duration_since(self.started_at).as_millis() as u64,
            "key sharing complete"
        );
        let outputs = self.engine.on_bootstrapped(now);
        self.dispatch(outputs);
    }

    fn announce(&mut self, now: Instant) {
        let targets = self.key_sharing.due_announcements(now);
        if targets.is_empty() {
            return;
        }
        let announce = KeyAnnounce::new(&self.engine.identity().keypair, self.engine.name(), false);
        tracing::debug!(node = %self.engine.name(), ?targets, "announcing key");
        for target in targets {
            self.send(
                target,
                Message::Peer(PeerMessage::KeyAnnounce(announce.clone())),
                self.engine.name().to_string(),
            );
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.announce(now);
        let outputs = self.engine.tick(now);
        self.dispatch(outputs);
        if self.engine.state().participates() {
            self.liveness.check(now);
        }
    }

    fn dispatch(&self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Broadcast(message) => {
                    for peer in self.engine.pool().others(self.engine.name()) {
                        self.send(
                            peer.clone(),
                            Message::Peer(message.clone()),
                            self.engine.name().to_string(),
                        );
                    }
                }
                Output::Reply { client_id, reply } => {
                    self.send(
                        client_id,
                        Message::Client(ClientMessage::Reply(reply)),
                        client_endpoint(self.engine.name()),
                    );
                }
            }
        }
    }

    fn send(&self, target: String, message: Message, from: String) {
        let transport = self.transport.clone();
        let kind = message.kind();
        tokio::spawn(async move {
            if let Err(err) = transport.send(&target, Envelope::new(from.clone(), message)).await {
                tracing::debug!(%from, %target, kind, error = %err, "send failed");
            }
        });
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            status: NodeStatus::of(&self.engine),
            records: self.engine.records().to_vec(),
            peer_keys: self.engine.identity().peer_keys.clone(),
            evidence: self.engine.evidence().to_vec(),
        }
    }

    fn publish_status(&self) {
        let current = NodeStatus::of(&self.engine);
        self.status.send_if_modified(|status| {
            if *status == current {
                false
            } else {
                *status = current;
                true
            }
        });
    }
}
