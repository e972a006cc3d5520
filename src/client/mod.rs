//! The client side of the pool: signs requests, broadcasts them to every
//! node's client-facing endpoint and decides when enough replies agree.

pub mod aggregator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use aggregator::{ConsensusStatus, QuorumCertificate, ReplyAggregator};

use crate::common::crypto::{Keypair, Pubkey};
use crate::common::error::{Error, Result};
use crate::config::{client_endpoint, ClientConfig};
use crate::consensus::message::{ClientId, ClientMessage, Message, NodeName, Reply, Request};
use crate::consensus::peers::Pool;
use crate::network::{Envelope, Inbox, LocalNetwork, TcpTransport, Transport};

struct Shared {
    aggregator: Mutex<ReplyAggregator>,
    node_keys: RwLock<HashMap<NodeName, Pubkey>>,
    arrived: Notify,
}

pub struct Client {
    identifier: ClientId,
    keypair: Keypair,
    nodes: Vec<NodeName>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    requests: HashMap<u64, Request>,
    next_req_id: u64,
    receiver: JoinHandle<()>,
}

impl Client {
    pub fn new(
        identifier: impl Into<ClientId>,
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Self {
        let identifier = identifier.into();
        let nodes = config.names();
        let f = Pool::new(nodes.iter().cloned()).f();
        let shared = Arc::new(Shared {
            aggregator: Mutex::new(ReplyAggregator::new(f, config.reply_deadline())),
            node_keys: RwLock::new(HashMap::new()),
            arrived: Notify::new(),
        });
        let receiver = tokio::spawn(receive_replies(identifier.clone(), shared.clone(), inbox));

        // Seeded from the clock so a restarted client keeps increasing.
        let next_req_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(1);

        Client {
            identifier,
            keypair: Keypair::new_pair(),
            nodes,
            transport,
            shared,
            requests: HashMap::new(),
            next_req_id,
            receiver,
        }
    }

    /// A client on an in-memory network, reachable at its identifier.
    pub fn local(identifier: impl Into<ClientId>, config: &ClientConfig, network: &LocalNetwork) -> Self {
        let identifier = identifier.into();
        let inbox = network.register(&identifier);
        Self::new(identifier, config, Arc::new(network.clone()), inbox)
    }

    /// A TCP client. Nodes answer over the connections it opens.
    pub fn tcp(identifier: impl Into<ClientId>, config: &ClientConfig) -> Self {
        let identifier = identifier.into();
        let (tx, inbox) = mpsc::unbounded_channel();
        let addrs = config
            .node_reg
            .iter()
            .map(|(name, addr)| (client_endpoint(name), *addr));
        let transport = TcpTransport::new(identifier.clone(), addrs, tx);
        Self::new(identifier, config, Arc::new(transport), inbox)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn verification_key(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Replies are only accepted from nodes whose key was added here.
    pub fn add_node_key(&self, node: impl Into<NodeName>, key: Pubkey) {
        self.shared.node_keys.write().insert(node.into(), key);
    }

    /// Signs `payload` under the next request id and broadcasts it.
    pub async fn submit(&mut self, payload: Value) -> Result<Request> {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let request = Request::new(&self.keypair, self.identifier.clone(), req_id, payload);
        self.requests.insert(req_id, request.clone());
        self.shared.aggregator.lock().track(req_id, Instant::now());

        tracing::info!(client = %self.identifier, req_id, "submitting request");
        self.broadcast(&request).await?;
        Ok(request)
    }

    /// Sends a stored request again and restarts its reply deadline.
    pub async fn resubmit(&self, req_id: u64) -> Result<()> {
        let request = self
            .requests
            .get(&req_id)
            .cloned()
            .ok_or(Error::UnknownRequest(req_id))?;
        self.shared.aggregator.lock().track(req_id, Instant::now());
        tracing::info!(client = %self.identifier, req_id, "resubmitting request");
        self.broadcast(&request).await
    }

    async fn broadcast(&self, request: &Request) -> Result<()> {
        let mut last_error = None;
        let mut delivered = 0;
        for node in &self.nodes {
            let envelope = Envelope::new(
                self.identifier.clone(),
                Message::Client(ClientMessage::SubmitRequest(request.clone())),
            );
            match self.transport.send(&client_endpoint(node), envelope).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(client = %self.identifier, %node, error = %err, "failed to send request");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if delivered == 0 => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Current verdict without waiting.
    pub fn poll_reply(&self, req_id: u64) -> Result<ConsensusStatus> {
        self.shared
            .aggregator
            .lock()
            .status(req_id, Instant::now())
            .ok_or(Error::UnknownRequest(req_id))
    }

    /// Waits until `f+1` nodes agree on a result or the deadline passes.
    pub async fn get_reply(&self, req_id: u64) -> Result<ConsensusStatus> {
        loop {
            let arrived = self.shared.arrived.notified();
            let (status, deadline) = {
                let aggregator = self.shared.aggregator.lock();
                let status = aggregator
                    .status(req_id, Instant::now())
                    .ok_or(Error::UnknownRequest(req_id))?;
                let deadline = aggregator.certificate(req_id).map(QuorumCertificate::deadline);
                (status, deadline)
            };
            if status != ConsensusStatus::NoConsensusYet {
                return Ok(status);
            }
            let deadline = deadline.unwrap_or_else(Instant::now);
            let _ = tokio::time::timeout_at(deadline, arrived).await;
        }
    }

    /// Like [`Client::get_reply`], but a missing quorum is an error.
    pub async fn wait_for_consensus(&self, req_id: u64) -> Result<Value> {
        match self.get_reply(req_id).await? {
            ConsensusStatus::ReachedConsensus(result) => Ok(result),
            ConsensusStatus::Timeout | ConsensusStatus::NoConsensusYet => Err(Error::QuorumTimeout(req_id)),
        }
    }

    /// Every reply received for `req_id`, matching or not. Diagnostic only.
    pub fn show_reply_details(&self, req_id: u64) -> Vec<Reply> {
        let aggregator = self.shared.aggregator.lock();
        let Some(certificate) = aggregator.certificate(req_id) else {
            return Vec::new();
        };
        let agreed = certificate.agreed_result(aggregator.quorum());
        let replies: Vec<Reply> = certificate.replies().cloned().collect();
        for reply in &replies {
            tracing::info!(
                client = %self.identifier,
                req_id,
                node = %reply.node_name,
                result = %reply.result,
                agrees = agreed.as_ref() == Some(&reply.result),
                "reply"
            );
        }
        replies
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_replies(identifier: ClientId, shared: Arc<Shared>, mut inbox: Inbox) {
    while let Some(envelope) = inbox.recv().await {
        let reply = match envelope.message {
            Message::Client(ClientMessage::Reply(reply)) => reply,
            other => {
                tracing::debug!(client = %identifier, from = %envelope.from, kind = other.kind(), "unexpected message");
                continue;
            }
        };

        let key = shared.node_keys.read().get(&reply.node_name).copied();
        let Some(key) = key else {
            tracing::warn!(client = %identifier, node = %reply.node_name, "reply from unknown node");
            continue;
        };
        if !reply.verify(&key) {
            tracing::warn!(client = %identifier, node = %reply.node_name, "reply with bad signature");
            continue;
        }

        tracing::debug!(client = %identifier, node = %reply.node_name, req_id = reply.req_id, "reply received");
        if shared.aggregator.lock().add(reply) {
            shared.arrived.notify_waiters();
        }
    }
}
