use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{Inbox, LocalNetwork, TcpTransport, Transport};
use crate::common::crypto::Pubkey;
use crate::common::error::{Error, Result};
use crate::config::{client_endpoint, PoolConfig};
use crate::consensus::auth::ClientAuthenticator;
use crate::consensus::engine::OrderingEngine;
use crate::consensus::execution::{RequestExecutor, TxnExecutor};
use crate::consensus::fault::{honest, ReplyBehavior};
use crate::consensus::message::NodeName;
use crate::consensus::peers::{NodeIdentity, Pool};
use crate::consensus::processor::{Command, ConsensusProcessor};
use crate::consensus::store::{KeyStore, Store};

pub use crate::consensus::processor::{NodeSnapshot, NodeStatus};

/// A pool member before it is started.
pub struct Node {
    name: NodeName,
    config: PoolConfig,
    behavior: Arc<dyn ReplyBehavior>,
    executor: Arc<dyn RequestExecutor>,
    authenticator: ClientAuthenticator,
}

impl Node {
    pub fn new(name: impl Into<NodeName>, config: PoolConfig) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        if !config.node_reg.contains_key(&name) {
            return Err(Error::Config(format!("{name} is not in the node registry")));
        }
        Ok(Node {
            name,
            config,
            behavior: honest(),
            executor: Arc::new(TxnExecutor),
            authenticator: ClientAuthenticator::new(),
        })
    }

    /// Fixes how this node shapes its replies for its whole lifetime.
    pub fn with_behavior(mut self, behavior: Arc<dyn ReplyBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Starts the node on an in-memory network.
    pub fn spawn_local(self, network: &LocalNetwork) -> Result<NodeHandle> {
        let (tx, inbox) = mpsc::unbounded_channel();
        network.attach(&self.name, tx.clone());
        network.attach(&client_endpoint(&self.name), tx);
        self.spawn(Arc::new(network.clone()), inbox)
    }

    /// Starts the node over TCP, listening on its registered peer address
    /// and, if configured, its client-facing address.
    pub async fn spawn_tcp(self) -> Result<NodeHandle> {
        let (tx, inbox) = mpsc::unbounded_channel();
        let peers = self
            .config
            .node_reg
            .iter()
            .filter(|(name, _)| **name != self.name)
            .map(|(name, addr)| (name.clone(), *addr));
        let transport = TcpTransport::new(self.name.clone(), peers, tx);

        transport.listen(self.config.node_reg[&self.name]).await?;
        if let Some(addr) = self.config.client_reg.get(&self.name) {
            transport.listen(*addr).await?;
        }
        self.spawn(Arc::new(transport), inbox)
    }

    fn spawn(self, transport: Arc<dyn Transport>, inbox: Inbox) -> Result<NodeHandle> {
        let node_dir = self.config.node_dir(&self.name);
        let key_store = match &node_dir {
            Some(dir) => KeyStore::at(dir),
            None => KeyStore::in_memory(),
        };
        let store = match &node_dir {
            Some(dir) => Store::open(dir)?,
            None => Store::new(),
        };

        let mut identity = NodeIdentity::new(self.name.clone(), key_store.load_or_create_identity()?);
        identity.peer_keys = key_store.load_peer_keys()?;
        let verification_key = identity.keypair.pubkey();

        let engine = OrderingEngine::new(
            identity,
            Pool::new(self.config.names()),
            self.config.protocol.clone(),
            self.authenticator.clone(),
            self.executor,
            self.behavior,
            store,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (processor, status) = ConsensusProcessor::new(engine, key_store, transport, inbox, command_rx);
        let task = tokio::spawn(processor.run());

        Ok(NodeHandle {
            name: self.name,
            verification_key,
            authenticator: self.authenticator,
            commands,
            status,
            task,
        })
    }
}

/// The host's handle on a running node.
pub struct NodeHandle {
    name: NodeName,
    verification_key: Pubkey,
    authenticator: ClientAuthenticator,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<NodeStatus>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key clients use to verify this node's replies.
    pub fn verification_key(&self) -> Pubkey {
        self.verification_key
    }

    pub fn start_key_sharing(&self) -> Result<()> {
        self.commands
            .send(Command::StartKeySharing)
            .map_err(|_| Error::NodeStopped)
    }

    /// Registers a client out of band.
    pub fn add_client(&self, id: &str, key: Pubkey) -> Result<()> {
        self.authenticator.add_client(id, key)
    }

    pub fn authenticator(&self) -> &ClientAuthenticator {
        &self.authenticator
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub async fn wait_for<F>(&self, condition: F) -> Result<NodeStatus>
    where
        F: FnMut(&NodeStatus) -> bool,
    {
        let mut status = self.status.clone();
        let matched = status.wait_for(condition).await.map_err(|_| Error::NodeStopped)?;
        Ok(NodeStatus::clone(&matched))
    }

    /// Waits until the node orders requests.
    pub async fn wait_ready(&self) -> Result<NodeStatus> {
        self.wait_for(|status| status.state.participates()).await
    }

    pub async fn inspect(&self) -> Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect(tx))
            .map_err(|_| Error::NodeStopped)?;
        rx.await.map_err(|_| Error::NodeStopped)
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            tracing::error!(node = %self.name, error = %err, "node task failed");
        }
        Ok(())
    }
}
