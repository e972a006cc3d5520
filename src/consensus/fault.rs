//! Reply-generation strategies, used to model nodes that vote correctly but
//! answer clients with wrong results.
//!
//! A strategy is fixed when the node is built; voting never goes through it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::message::Request;

pub trait ReplyBehavior: Send + Sync + fmt::Debug {
    /// Shapes the executed result before it is signed and sent.
    fn shape_result(&self, request: &Request, result: Value) -> Value;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Honest;

impl ReplyBehavior for Honest {
    fn shape_result(&self, _request: &Request, result: Value) -> Value {
        result
    }
}

type Transform = dyn Fn(&Request, Value) -> Value + Send + Sync;

/// Applies a caller-supplied transform to every result.
pub struct CorruptReply {
    label: String,
    transform: Box<Transform>,
}

impl CorruptReply {
    pub fn new<F>(label: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Request, Value) -> Value + Send + Sync + 'static,
    {
        CorruptReply {
            label: label.into(),
            transform: Box::new(transform),
        }
    }
}

impl fmt::Debug for CorruptReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorruptReply").field("label", &self.label).finish()
    }
}

impl ReplyBehavior for CorruptReply {
    fn shape_result(&self, request: &Request, result: Value) -> Value {
        (self.transform)(request, result)
    }
}

/// Replaces the transaction id of every result, so the reply still looks
/// well formed but never matches the honest ones.
pub fn faulty_reply() -> Arc<dyn ReplyBehavior> {
    Arc::new(CorruptReply::new("faulty_reply", |_request, mut result| {
        match result.as_object_mut() {
            Some(fields) => {
                fields.insert("txnId".into(), Value::String("deadbeef".repeat(8)));
                result
            }
            None => Value::String(format!("corrupted:{result}")),
        }
    }))
}

pub fn honest() -> Arc<dyn ReplyBehavior> {
    Arc::new(Honest)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::crypto::Keypair;

    fn request() -> Request {
        Request::new(&Keypair::new_pair(), "c", 1, json!({"type": "sell", "amount": 101}))
    }

    #[test]
    fn test_honest_passes_result_through() {
        let result = json!({"txnId": "abc"});
        assert_eq!(honest().shape_result(&request(), result.clone()), result);
    }

    #[test]
    fn test_faulty_reply_changes_txn_id_only() {
        let result = json!({"txnId": "abc", "reqId": 1});
        let shaped = faulty_reply().shape_result(&request(), result.clone());
        assert_ne!(shaped, result);
        assert_eq!(shaped["reqId"], 1);
        assert_ne!(shaped["txnId"], "abc");

        let scalar = faulty_reply().shape_result(&request(), json!(7));
        assert_eq!(scalar, json!("corrupted:7"));
    }

    #[test]
    fn test_custom_transform_sees_request() {
        let behavior = CorruptReply::new("echo_req", |request, _| json!(request.req_id + 1));
        assert_eq!(behavior.shape_result(&request(), json!(null)), json!(2));
    }
}
