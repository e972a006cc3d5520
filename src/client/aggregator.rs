//! Client-side quorum decision over node replies.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::consensus::message::{canonical_bytes, NodeName, Reply};

#[derive(Clone, Debug, PartialEq)]
pub enum ConsensusStatus {
    NoConsensusYet,
    /// At least `f+1` nodes returned this exact result.
    ReachedConsensus(Value),
    /// The deadline passed without a quorum. A later poll may still see one.
    Timeout,
}

/// Replies collected for one request, one per node.
#[derive(Clone, Debug)]
pub struct QuorumCertificate {
    pub req_id: u64,
    replies: BTreeMap<NodeName, Reply>,
    deadline: Instant,
}

impl QuorumCertificate {
    pub fn new(req_id: u64, deadline: Instant) -> Self {
        QuorumCertificate {
            req_id,
            replies: BTreeMap::new(),
            deadline,
        }
    }

    /// Keeps the first reply of each node; later ones are ignored.
    pub fn add(&mut self, reply: Reply) -> bool {
        if let Some(existing) = self.replies.get(&reply.node_name) {
            if existing.result != reply.result {
                tracing::warn!(node = %reply.node_name, req_id = reply.req_id, "node changed its reply, ignoring");
            }
            return false;
        }
        self.replies.insert(reply.node_name.clone(), reply);
        true
    }

    /// The result returned by at least `quorum` nodes, compared byte for
    /// byte on the canonical encoding. Two results that both reach the
    /// quorum mean more than `f` nodes are faulty, and neither is trusted.
    pub fn agreed_result(&self, quorum: usize) -> Option<Value> {
        let mut groups: BTreeMap<Vec<u8>, (usize, &Value)> = BTreeMap::new();
        for reply in self.replies.values() {
            let entry = groups
                .entry(canonical_bytes(&reply.result))
                .or_insert((0, &reply.result));
            entry.0 += 1;
        }
        let mut agreed = groups.into_values().filter(|(count, _)| *count >= quorum);
        let (_, result) = agreed.next()?;
        if agreed.next().is_some() {
            tracing::warn!(req_id = self.req_id, quorum, "conflicting results both reached the quorum");
            return None;
        }
        Some(result.clone())
    }

    pub fn replies(&self) -> impl Iterator<Item = &Reply> {
        self.replies.values()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Tracks every outstanding request of one client.
#[derive(Debug)]
pub struct ReplyAggregator {
    quorum: usize,
    reply_deadline: Duration,
    certificates: HashMap<u64, QuorumCertificate>,
}

impl ReplyAggregator {
    /// `f` is the pool's fault bound; a result needs `f+1` matching replies.
    pub fn new(f: usize, reply_deadline: Duration) -> Self {
        ReplyAggregator {
            quorum: f + 1,
            reply_deadline,
            certificates: HashMap::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Starts (or restarts) the deadline for `req_id`.
    pub fn track(&mut self, req_id: u64, now: Instant) {
        let deadline = now + self.reply_deadline;
        self.certificates
            .entry(req_id)
            .and_modify(|certificate| certificate.deadline = deadline)
            .or_insert_with(|| QuorumCertificate::new(req_id, deadline));
    }

    /// Returns `false` for replies to unknown requests and repeated replies.
    pub fn add(&mut self, reply: Reply) -> bool {
        match self.certificates.get_mut(&reply.req_id) {
            Some(certificate) => certificate.add(reply),
            None => {
                tracing::debug!(node = %reply.node_name, req_id = reply.req_id, "reply for unknown request");
                false
            }
        }
    }

    /// `None` if `req_id` was never tracked.
    pub fn status(&self, req_id: u64, now: Instant) -> Option<ConsensusStatus> {
        let certificate = self.certificates.get(&req_id)?;
        Some(match certificate.agreed_result(self.quorum) {
            Some(result) => ConsensusStatus::ReachedConsensus(result),
            None if now >= certificate.deadline => ConsensusStatus::Timeout,
            None => ConsensusStatus::NoConsensusYet,
        })
    }

    pub fn certificate(&self, req_id: u64) -> Option<&QuorumCertificate> {
        self.certificates.get(&req_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::crypto::Keypair;

    fn reply(node: &str, result: Value) -> Reply {
        Reply::new(&Keypair::new_pair(), node, 1, result)
    }

    #[test]
    fn test_consensus_needs_f_plus_one_identical_results() {
        let now = Instant::now();
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        aggregator.track(1, now);
        assert_eq!(aggregator.status(1, now), Some(ConsensusStatus::NoConsensusYet));

        aggregator.add(reply("Alpha", json!({"txnId": "a"})));
        aggregator.add(reply("Beta", json!({"txnId": "b"})));
        assert_eq!(aggregator.status(1, now), Some(ConsensusStatus::NoConsensusYet));

        aggregator.add(reply("Gamma", json!({"txnId": "a"})));
        assert_eq!(
            aggregator.status(1, now),
            Some(ConsensusStatus::ReachedConsensus(json!({"txnId": "a"})))
        );
    }

    #[test]
    fn test_repeated_replies_from_one_node_count_once() {
        let now = Instant::now();
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        aggregator.track(1, now);
        assert!(aggregator.add(reply("Beta", json!(1))));
        assert!(!aggregator.add(reply("Beta", json!(1))));
        assert!(!aggregator.add(reply("Beta", json!(2))));
        assert_eq!(aggregator.status(1, now), Some(ConsensusStatus::NoConsensusYet));
        assert_eq!(aggregator.certificate(1).unwrap().replies().count(), 1);
    }

    #[test]
    fn test_timeout_then_late_consensus() {
        let now = Instant::now();
        let later = now + Duration::from_secs(2);
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        aggregator.track(1, now);
        aggregator.add(reply("Alpha", json!("ok")));
        assert_eq!(aggregator.status(1, later), Some(ConsensusStatus::Timeout));

        aggregator.add(reply("Delta", json!("ok")));
        assert_eq!(
            aggregator.status(1, later),
            Some(ConsensusStatus::ReachedConsensus(json!("ok")))
        );
    }

    #[test]
    fn test_two_quorate_results_are_not_consensus() {
        let now = Instant::now();
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        aggregator.track(1, now);
        aggregator.add(reply("Alpha", json!("a")));
        aggregator.add(reply("Beta", json!("b")));
        aggregator.add(reply("Delta", json!("b")));
        assert_eq!(
            aggregator.status(1, now),
            Some(ConsensusStatus::ReachedConsensus(json!("b")))
        );

        aggregator.add(reply("Gamma", json!("a")));
        assert_eq!(aggregator.status(1, now), Some(ConsensusStatus::NoConsensusYet));
        assert_eq!(
            aggregator.status(1, now + Duration::from_secs(2)),
            Some(ConsensusStatus::Timeout)
        );
    }

    #[test]
    fn test_untracked_requests() {
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        assert!(!aggregator.add(reply("Alpha", json!(1))));
        assert_eq!(aggregator.status(1, Instant::now()), None);
    }

    #[test]
    fn test_key_order_does_not_split_results() {
        let now = Instant::now();
        let mut aggregator = ReplyAggregator::new(1, Duration::from_secs(1));
        aggregator.track(1, now);
        aggregator.add(reply("Alpha", serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap()));
        aggregator.add(reply("Beta", serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap()));
        assert!(matches!(
            aggregator.status(1, now),
            Some(ConsensusStatus::ReachedConsensus(_))
        ));
    }
}
