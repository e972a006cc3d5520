//! Error types shared across the pool.

use thiserror::Error;

use super::crypto::Digest;
use crate::network::NetworkError;

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The request's client has not been registered on this node.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// The sender is not a member of the pool.
    #[error("unknown pool member: {0}")]
    UnknownPeer(String),

    /// A signature did not verify against the registered key.
    #[error("bad signature from {0}")]
    BadSignature(String),

    /// An identity is already bound to a different verification key.
    #[error("key substitution rejected for {0}")]
    KeySubstitution(String),

    /// The primary proposed something that contradicts the local log.
    #[error("ordering conflict at seq {seq} in view {view}: have {existing}, proposed {proposed}")]
    OrderingConflict {
        /// Sequence number of the contested slot.
        seq: u64,
        /// View in which the conflict was observed.
        view: u64,
        /// Digest already bound to the slot or request.
        existing: Digest,
        /// Digest carried by the offending proposal.
        proposed: Digest,
    },

    /// A different request reuses an already known `(clientId, reqId)`.
    #[error("request {client_id}/{req_id} conflicts with a known request")]
    RequestConflict {
        /// Client identifier.
        client_id: String,
        /// Request identifier.
        req_id: u64,
    },

    /// The client never submitted this request.
    #[error("unknown request {0}")]
    UnknownRequest(u64),

    /// The client gave up waiting for matching replies.
    #[error("no quorum of replies for request {0} before the deadline")]
    QuorumTimeout(u64),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Malformed key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The node actor has shut down.
    #[error("node stopped")]
    NodeStopped,
}

/// A specialized Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
