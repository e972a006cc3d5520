//! A permissioned pool of nodes that agrees on a single total order of
//! client requests and tolerates up to `f` Byzantine members out of
//! `n = 3f + 1`.
//!
//! Nodes exchange signed Propose, Prepare and Commit votes, replace a
//! faulty primary through view changes and execute requests in sequence
//! order. Clients accept a result once `f + 1` nodes return it.

pub mod client;
pub mod common;
pub mod config;
pub mod consensus;
pub mod network;

pub use client::{Client, ConsensusStatus};
pub use common::{Error, Result};
pub use config::{ClientConfig, PoolConfig, ProtocolConfig};
pub use network::{LocalNetwork, Node, NodeHandle, NodeSnapshot, NodeStatus};
