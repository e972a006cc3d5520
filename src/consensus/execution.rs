//! Execution of ordered requests.

use serde_json::{json, Value};

use super::message::{canonical_bytes, Request};
use super::store::OrderedRequestRecord;
use crate::common::crypto::Digest;

/// The application that executes requests once the pool has ordered them.
///
/// Execution must be deterministic: honest nodes compare their results
/// through the client's quorum check.
pub trait RequestExecutor: Send + Sync {
    fn execute(&self, record: &OrderedRequestRecord, request: &Request) -> Value;
}

/// Treats the payload as an opaque transaction and answers with a receipt.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxnExecutor;

impl RequestExecutor for TxnExecutor {
    fn execute(&self, record: &OrderedRequestRecord, request: &Request) -> Value {
        let txn_id = Digest::of(&[
            request.client_id.as_bytes(),
            request.req_id.to_be_bytes().as_slice(),
            canonical_bytes(&request.payload).as_slice(),
        ]);
        json!({
            "identifier": request.client_id,
            "reqId": request.req_id,
            "seqNo": record.seq,
            "txnId": txn_id.to_hex(),
        })
    }
}
