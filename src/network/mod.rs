//! Transport between pool members and between nodes and their clients.
//!
//! Delivery is best effort: messages may be lost, duplicated or reordered,
//! and every protocol message is safe to process out of order or twice.
//! Each node owns two endpoints, its peer endpoint (the node name) and its
//! client-facing endpoint (`<name>C`); both feed the same inbox.

pub mod local;
pub mod node;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::consensus::message::Message;

pub use local::LocalNetwork;
pub use node::{Node, NodeHandle, NodeSnapshot, NodeStatus};
pub use tcp::TcpTransport;

/// A message together with the endpoint it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<String>, message: Message) -> Self {
        Envelope {
            from: from.into(),
            message,
        }
    }
}

pub type InboxSender = mpsc::UnboundedSender<Envelope>;
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// The target (or the sender) is offline.
    #[error("endpoint {0} is unavailable")]
    Unavailable(String),

    #[error("no route to endpoint {0}")]
    PeerNotFound(String),

    /// The receiving side has gone away.
    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `envelope` to the endpoint named `target`.
    async fn send(&self, target: &str, envelope: Envelope) -> Result<(), NetworkError>;
}
