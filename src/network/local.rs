//! In-memory network for running a whole pool inside one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{Envelope, Inbox, InboxSender, NetworkError, Transport};
use crate::config::client_endpoint;

#[derive(Default)]
struct Routes {
    endpoints: HashMap<String, InboxSender>,
    offline: HashSet<String>,
}

/// Routes envelopes between registered endpoints through unbounded
/// channels. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` and returns its inbox. Registering a name again
    /// replaces the previous inbox.
    pub fn register(&self, endpoint: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(endpoint, tx);
        rx
    }

    /// Routes traffic for `endpoint` into an existing inbox.
    pub fn attach(&self, endpoint: &str, inbox: InboxSender) {
        self.routes.write().endpoints.insert(endpoint.to_string(), inbox);
    }

    /// Drops all traffic to and from `endpoint` while offline.
    pub fn set_offline(&self, endpoint: &str, offline: bool) {
        let mut routes = self.routes.write();
        if offline {
            routes.offline.insert(endpoint.to_string());
        } else {
            routes.offline.remove(endpoint);
        }
        tracing::info!(endpoint, offline, "endpoint connectivity changed");
    }

    /// Takes both endpoints of a node offline (or back online).
    pub fn isolate_node(&self, node: &str, isolated: bool) {
        self.set_offline(node, isolated);
        self.set_offline(&client_endpoint(node), isolated);
    }

    pub fn is_offline(&self, endpoint: &str) -> bool {
        self.routes.read().offline.contains(endpoint)
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, target: &str, envelope: Envelope) -> Result<(), NetworkError> {
        let routes = self.routes.read();
        if routes.offline.contains(target) {
            return Err(NetworkError::Unavailable(target.to_string()));
        }
        if routes.offline.contains(&envelope.from) {
            return Err(NetworkError::Unavailable(envelope.from));
        }
        let inbox = routes
            .endpoints
            .get(target)
            .ok_or_else(|| NetworkError::PeerNotFound(target.to_string()))?;
        inbox.send(envelope).map_err(|_| NetworkError::Closed)
    }
}
