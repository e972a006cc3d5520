pub mod auth;
pub mod bootstrap;
pub mod engine;
pub mod execution;
pub mod fault;
pub mod message;
pub mod peers;
pub mod processor;
pub mod qc;
pub mod store;
pub mod view_change;

pub use auth::ClientAuthenticator;
pub use engine::{ConflictEvidence, ConflictKind, NodeState, OrderingEngine, Output};
pub use execution::{RequestExecutor, TxnExecutor};
pub use fault::{faulty_reply, honest, CorruptReply, ReplyBehavior};
pub use message::*;
pub use peers::*;
pub use processor::{NodeSnapshot, NodeStatus};
pub use store::{KeyStore, OrderedRequestRecord, Store};
