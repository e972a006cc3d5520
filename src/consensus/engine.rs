//! The request ordering state machine.
//!
//! The engine is synchronous: it takes one event at a time together with the
//! current time and returns what the node has to send. The node actor owns
//! it and drives it from the network, the host and a periodic tick.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use super::auth::ClientAuthenticator;
use super::execution::RequestExecutor;
use super::fault::ReplyBehavior;
use super::message::{ClientId, NodeName, PeerMessage, PreparedProof, Reply, Request, RequestKey, Stage, Vote};
use super::peers::{NodeIdentity, PeerKeyRegistry, Pool, Role};
use super::qc::{VoteBook, VoteKey};
use super::store::{OrderedRequestRecord, Store};
use super::view_change::ViewChangeState;
use crate::common::crypto::{Digest, Hashable};
use crate::common::error::{Error, Result};
use crate::config::ProtocolConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Uninitialized,
    Bootstrapping,
    /// Bootstrapped and ordering in the initial view.
    Ready,
    /// Ordering in a view entered through a view change.
    ViewActive,
    ViewChanging,
}

impl NodeState {
    /// Whether the node orders requests in this state.
    pub fn participates(self) -> bool {
        matches!(self, NodeState::Ready | NodeState::ViewActive)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ConflictKind {
    /// The sequence number is already bound to another digest.
    SlotTaken { existing: Digest },
    /// The request already holds another sequence number.
    AlreadyOrdered { at_seq: u64 },
}

/// A primary's proposal that contradicts the local log, kept for inspection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConflictEvidence {
    pub view: u64,
    pub seq: u64,
    pub proposed: Digest,
    pub kind: ConflictKind,
    /// The signed proposal itself.
    pub propose: Vote,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// Send to every other pool member.
    Broadcast(PeerMessage),
    /// Send to a client.
    Reply { client_id: ClientId, reply: Reply },
}

#[derive(Debug)]
pub(super) struct Slot {
    pub(super) view: u64,
    pub(super) digest: Digest,
    pub(super) propose: Vote,
    pub(super) prepared: bool,
    pub(super) committed: bool,
}

pub struct OrderingEngine {
    pub(super) identity: NodeIdentity,
    pub(super) pool: Pool,
    pub(super) config: ProtocolConfig,
    pub(super) state: NodeState,
    pub(super) view: u64,
    pub(super) authenticator: ClientAuthenticator,
    executor: Arc<dyn RequestExecutor>,
    behavior: Arc<dyn ReplyBehavior>,
    pub(super) store: Store,

    pub(super) requests: HashMap<Digest, Request>,
    pub(super) request_keys: HashMap<RequestKey, Digest>,
    /// Authenticated requests without a sequence number, in arrival order.
    pub(super) pending: VecDeque<Digest>,
    /// View-change deadline of every request not yet executed.
    pub(super) waiting: HashMap<Digest, Instant>,
    /// Proposals whose request has not arrived yet.
    pub(super) awaiting_request: HashMap<Digest, Vote>,

    pub(super) slots: BTreeMap<u64, Slot>,
    pub(super) assigned: HashMap<Digest, u64>,
    pub(super) prepares: VoteBook,
    pub(super) commits: VoteBook,
    /// Prepared certificates for recent sequence numbers.
    pub(super) proofs: BTreeMap<u64, PreparedProof>,
    pub(super) next_seq: u64,
    pub(super) last_executed: u64,
    pub(super) executed: HashMap<RequestKey, u64>,
    replies: HashMap<RequestKey, Reply>,
    /// Highest sequence number a null proposal may fill in this view.
    pub(super) refill_through: u64,

    pub(super) parked: VecDeque<PeerMessage>,
    /// Members seen voting in each view above ours.
    pub(super) ahead: BTreeMap<u64, BTreeSet<NodeName>>,
    evidence: Vec<ConflictEvidence>,
    pub(super) suspect: bool,
    pub(super) view_change: ViewChangeState,
}

impl OrderingEngine {
    /// Builds an engine on top of `store`, restoring what a previous run
    /// executed.
    pub fn new(
        identity: NodeIdentity,
        pool: Pool,
        config: ProtocolConfig,
        authenticator: ClientAuthenticator,
        executor: Arc<dyn RequestExecutor>,
        behavior: Arc<dyn ReplyBehavior>,
        store: Store,
    ) -> Self {
        let mut executed = HashMap::new();
        let mut request_keys = HashMap::new();
        let mut replies = HashMap::new();
        for record in store.records() {
            executed.insert(record.key(), record.seq);
            request_keys.insert(record.key(), record.digest);
            if let Some(reply) = store.reply(record.seq) {
                replies.insert(record.key(), reply.clone());
            }
        }
        let last_executed = store.last_seq();

        OrderingEngine {
            identity,
            pool,
            config,
            state: NodeState::Uninitialized,
            view: 0,
            authenticator,
            executor,
            behavior,
            store,
            requests: HashMap::new(),
            request_keys,
            pending: VecDeque::new(),
            waiting: HashMap::new(),
            awaiting_request: HashMap::new(),
            slots: BTreeMap::new(),
            assigned: HashMap::new(),
            prepares: VoteBook::default(),
            commits: VoteBook::default(),
            proofs: BTreeMap::new(),
            next_seq: last_executed + 1,
            last_executed,
            executed,
            replies,
            refill_through: 0,
            parked: VecDeque::new(),
            ahead: BTreeMap::new(),
            evidence: Vec::new(),
            suspect: false,
            view_change: ViewChangeState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn primary(&self) -> &str {
        self.pool.get_leader(self.view)
    }

    pub fn role(&self) -> Role {
        self.identity.role(&self.pool, self.view)
    }

    pub fn last_executed(&self) -> u64 {
        self.last_executed
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn peer_keys_mut(&mut self) -> &mut PeerKeyRegistry {
        &mut self.identity.peer_keys
    }

    pub fn records(&self) -> &[OrderedRequestRecord] {
        self.store.records()
    }

    pub fn evidence(&self) -> &[ConflictEvidence] {
        &self.evidence
    }

    pub fn start_bootstrap(&mut self) {
        if self.state == NodeState::Uninitialized {
            self.state = NodeState::Bootstrapping;
        }
    }

    /// Every peer key is known: start ordering in view 0 and replay what was
    /// parked meanwhile.
    pub fn on_bootstrapped(&mut self, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        if self.state != NodeState::Bootstrapping {
            return out;
        }
        self.state = NodeState::Ready;
        tracing::info!(node = %self.identity.name, primary = self.primary(), "node ready");

        let deadline = now + self.config.view_change_timeout();
        for entry in self.waiting.values_mut() {
            *entry = deadline;
        }
        self.replay_parked(now, &mut out);
        self.try_propose(&mut out);
        out
    }

    /// Admits a client request. Rejected requests never enter ordering.
    pub fn on_request(&mut self, request: Request, now: Instant) -> Result<Vec<Output>> {
        self.authenticator.verify(&request)?;

        let mut out = Vec::new();
        let key = request.key();
        let digest = request.hash();
        if let Some(known) = self.request_keys.get(&key) {
            if *known != digest {
                return Err(Error::RequestConflict {
                    client_id: key.client_id,
                    req_id: key.req_id,
                });
            }
            match self.replies.get(&key) {
                Some(reply) => {
                    tracing::debug!(node = %self.identity.name, client = %key.client_id, req_id = key.req_id, "resending cached reply");
                    out.push(Output::Reply {
                        client_id: key.client_id.clone(),
                        reply: reply.clone(),
                    });
                }
                None => {
                    tracing::debug!(node = %self.identity.name, client = %key.client_id, req_id = key.req_id, "duplicate request");
                }
            }
            return Ok(out);
        }

        tracing::debug!(node = %self.identity.name, client = %key.client_id, req_id = key.req_id, %digest, "request accepted");
        self.request_keys.insert(key, digest);
        self.requests.insert(digest, request);
        self.pending.push_back(digest);
        self.waiting.insert(digest, now + self.config.view_change_timeout());

        if self.state.participates() {
            if let Some(propose) = self.awaiting_request.remove(&digest) {
                self.on_propose(propose, now, &mut out);
            }
            self.try_propose(&mut out);
        }
        Ok(out)
    }

    pub fn on_peer_message(&mut self, message: PeerMessage, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        match self.state {
            NodeState::Uninitialized | NodeState::Bootstrapping => self.park(message),
            _ => self.dispatch(message, now, &mut out),
        }
        out
    }

    /// Timer-driven work: proposing when the window frees up, suspecting a
    /// stalled primary and escalating a stalled view change.
    pub fn tick(&mut self, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        match self.state {
            NodeState::Ready | NodeState::ViewActive => match self.role() {
                Role::Primary => self.try_propose(&mut out),
                Role::Backup => {
                    let expired = self.waiting.values().any(|deadline| *deadline <= now);
                    if self.suspect || expired {
                        tracing::warn!(
                            node = %self.identity.name,
                            view = self.view,
                            primary = self.primary(),
                            conflict = self.suspect,
                            "suspecting primary"
                        );
                        self.start_view_change(self.view + 1, now, &mut out);
                    }
                }
            },
            NodeState::ViewChanging => self.check_escalation(now, &mut out),
            NodeState::Uninitialized | NodeState::Bootstrapping => {}
        }
        out
    }

    fn dispatch(&mut self, message: PeerMessage, now: Instant, out: &mut Vec<Output>) {
        match message {
            PeerMessage::Propose(vote) => self.on_propose(vote, now, out),
            PeerMessage::Prepare(vote) => self.on_prepare(vote, now, out),
            PeerMessage::Commit(vote) => self.on_commit(vote, now, out),
            PeerMessage::ViewChange(view_change) => self.on_view_change(view_change, now, out),
            // Key sharing is handled by the node actor.
            PeerMessage::KeyAnnounce(_) | PeerMessage::KeyAck(_) => {}
        }
    }

    pub(super) fn park(&mut self, message: PeerMessage) {
        if self.parked.len() >= self.config.max_parked_messages {
            tracing::debug!(node = %self.identity.name, "parking queue full, dropping oldest");
            self.parked.pop_front();
        }
        self.parked.push_back(message);
    }

    pub(super) fn replay_parked(&mut self, now: Instant, out: &mut Vec<Output>) {
        let parked: Vec<PeerMessage> = self.parked.drain(..).collect();
        for message in parked {
            self.dispatch(message, now, out);
        }
    }

    fn verify_vote(&self, stage: Stage, vote: &Vote) -> bool {
        if vote.node == self.identity.name || !self.pool.is_member(&vote.node) {
            return false;
        }
        match self.identity.key_of(&vote.node) {
            Some(key) => vote.verify(stage, &key),
            None => false,
        }
    }

    /// Remembers a validly signed vote cast in a view above ours.
    fn note_view_ahead(&mut self, stage: Stage, vote: &Vote) {
        if self.verify_vote(stage, vote) {
            self.ahead.entry(vote.view).or_default().insert(vote.node.clone());
        }
    }

    /// Joins the highest view in which `f+1` members are seen voting. At
    /// least one of them is honest, so the pool has moved on without us.
    fn check_view_ahead(&mut self, now: Instant, out: &mut Vec<Output>) {
        let quorum = self.pool.weak_quorum();
        let Some(view) = self
            .ahead
            .iter()
            .rev()
            .find(|(_, voters)| voters.len() >= quorum)
            .map(|(view, _)| *view)
        else {
            return;
        };
        if view > self.view {
            self.adopt_view(view, now, out);
        }
    }

    fn on_propose(&mut self, vote: Vote, now: Instant, out: &mut Vec<Output>) {
        if vote.view < self.view {
            tracing::debug!(node = %self.identity.name, view = vote.view, "stale propose");
            return;
        }
        if vote.view > self.view {
            self.note_view_ahead(Stage::Propose, &vote);
            self.park(PeerMessage::Propose(vote));
            self.check_view_ahead(now, out);
            return;
        }
        if self.state == NodeState::ViewChanging || vote.seq == 0 {
            return;
        }
        if vote.node != self.primary() {
            tracing::warn!(node = %self.identity.name, from = %vote.node, view = vote.view, "propose not from primary");
            return;
        }
        if !self.verify_vote(Stage::Propose, &vote) {
            tracing::warn!(node = %self.identity.name, from = %vote.node, "propose with bad signature");
            return;
        }

        let (seq, digest) = (vote.seq, vote.digest);
        if seq > self.last_executed + self.config.pipeline_window {
            tracing::warn!(node = %self.identity.name, from = %vote.node, seq, last_executed = self.last_executed, "propose outside the pipeline window");
            return;
        }
        if digest.is_null() && seq > self.last_executed.max(self.refill_through) {
            tracing::warn!(node = %self.identity.name, from = %vote.node, seq, "null propose outside a view-change refill");
            return;
        }
        if seq <= self.last_executed {
            let existing = self.store.get(seq).map_or(Digest::NULL, |record| record.digest);
            if existing != digest {
                self.record_conflict(vote, ConflictKind::SlotTaken { existing });
                return;
            }
            // Already executed here; vote so lagging members can finish.
            self.send_vote(Stage::Prepare, seq, digest, out);
            self.send_vote(Stage::Commit, seq, digest, out);
            return;
        }

        if let Some(slot) = self.slots.get(&seq) {
            if slot.digest == digest && slot.committed {
                self.send_vote(Stage::Prepare, seq, digest, out);
                self.send_vote(Stage::Commit, seq, digest, out);
                return;
            }
            if slot.digest == digest && slot.view == self.view {
                return;
            }
            if slot.view == self.view || slot.committed {
                let existing = slot.digest;
                self.record_conflict(vote, ConflictKind::SlotTaken { existing });
                return;
            }
        }

        if !digest.is_null() {
            let Some(request) = self.requests.get(&digest) else {
                tracing::debug!(node = %self.identity.name, seq, %digest, "holding propose until request arrives");
                self.awaiting_request.insert(digest, vote);
                return;
            };
            let ordered_at = self
                .executed
                .get(&request.key())
                .or_else(|| self.assigned.get(&digest))
                .copied();
            if let Some(at_seq) = ordered_at.filter(|at_seq| *at_seq != seq) {
                self.record_conflict(vote, ConflictKind::AlreadyOrdered { at_seq });
                return;
            }
            self.assigned.insert(digest, seq);
            self.pending.retain(|pending| *pending != digest);
            self.waiting.insert(digest, now + self.config.view_change_timeout());
        }

        tracing::debug!(node = %self.identity.name, view = self.view, seq, %digest, "propose accepted");
        self.slots.insert(
            seq,
            Slot {
                view: self.view,
                digest,
                propose: vote,
                prepared: false,
                committed: false,
            },
        );
        self.send_vote(Stage::Prepare, seq, digest, out);
        self.check_progress(seq, out);
    }

    fn on_prepare(&mut self, vote: Vote, now: Instant, out: &mut Vec<Output>) {
        if vote.view > self.view {
            self.note_view_ahead(Stage::Prepare, &vote);
            self.park(PeerMessage::Prepare(vote));
            self.check_view_ahead(now, out);
            return;
        }
        if vote.view < self.view || vote.seq <= self.last_executed {
            return;
        }
        if vote.node == self.primary() {
            tracing::debug!(node = %self.identity.name, seq = vote.seq, "ignoring prepare from primary");
            return;
        }
        if !self.verify_vote(Stage::Prepare, &vote) {
            tracing::warn!(node = %self.identity.name, from = %vote.node, "prepare with bad signature");
            return;
        }
        let seq = vote.seq;
        if self.prepares.add(vote) {
            self.check_progress(seq, out);
        }
    }

    fn on_commit(&mut self, vote: Vote, now: Instant, out: &mut Vec<Output>) {
        if vote.view > self.view {
            self.note_view_ahead(Stage::Commit, &vote);
            self.park(PeerMessage::Commit(vote));
            self.check_view_ahead(now, out);
            return;
        }
        if vote.view < self.view || vote.seq <= self.last_executed {
            return;
        }
        if !self.verify_vote(Stage::Commit, &vote) {
            tracing::warn!(node = %self.identity.name, from = %vote.node, "commit with bad signature");
            return;
        }
        let seq = vote.seq;
        if self.commits.add(vote) {
            self.check_progress(seq, out);
        }
    }

    /// Signs and broadcasts our own vote, counting it locally.
    pub(super) fn send_vote(&mut self, stage: Stage, seq: u64, digest: Digest, out: &mut Vec<Output>) {
        let vote = Vote::new(stage, &self.identity.keypair, &self.identity.name, self.view, seq, digest);
        let message = match stage {
            Stage::Propose => PeerMessage::Propose(vote.clone()),
            Stage::Prepare => PeerMessage::Prepare(vote.clone()),
            Stage::Commit => PeerMessage::Commit(vote.clone()),
        };
        if seq > self.last_executed {
            match stage {
                Stage::Prepare => {
                    self.prepares.add(vote);
                }
                Stage::Commit => {
                    self.commits.add(vote);
                }
                Stage::Propose => {}
            }
        }
        out.push(Output::Broadcast(message));
    }

    /// Proposes pending requests while the pipeline window allows.
    pub(super) fn try_propose(&mut self, out: &mut Vec<Output>) {
        if !self.state.participates() || self.role() != Role::Primary {
            return;
        }
        while self.next_seq <= self.last_executed + self.config.pipeline_window {
            let Some(digest) = self.pending.pop_front() else {
                break;
            };
            if self.assigned.contains_key(&digest) {
                continue;
            }
            let Some(request) = self.requests.get(&digest) else {
                continue;
            };
            if self.executed.contains_key(&request.key()) {
                continue;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.propose(seq, digest, out);
        }
    }

    pub(super) fn propose(&mut self, seq: u64, digest: Digest, out: &mut Vec<Output>) {
        let vote = Vote::new(Stage::Propose, &self.identity.keypair, &self.identity.name, self.view, seq, digest);
        tracing::debug!(node = %self.identity.name, view = self.view, seq, %digest, "proposing");
        out.push(Output::Broadcast(PeerMessage::Propose(vote.clone())));

        let settled = seq <= self.last_executed
            || self
                .slots
                .get(&seq)
                .is_some_and(|slot| slot.committed && slot.digest == digest);
        if settled {
            self.send_vote(Stage::Commit, seq, digest, out);
            return;
        }

        if !digest.is_null() {
            self.assigned.insert(digest, seq);
        }
        self.slots.insert(
            seq,
            Slot {
                view: self.view,
                digest,
                propose: vote,
                prepared: false,
                committed: false,
            },
        );
        self.check_progress(seq, out);
    }

    /// Moves the slot at `seq` through prepared and committed as votes allow.
    fn check_progress(&mut self, seq: u64, out: &mut Vec<Output>) {
        let Some(slot) = self.slots.get(&seq) else {
            return;
        };
        if slot.view != self.view {
            return;
        }
        let digest = slot.digest;
        let key = VoteKey {
            view: slot.view,
            seq,
            digest,
        };
        let primary = self.pool.get_leader(slot.view).to_string();

        if !slot.prepared && self.prepares.count_excluding(&key, &primary) >= self.pool.prepare_quorum() {
            let proof = PreparedProof {
                propose: slot.propose.clone(),
                prepares: self
                    .prepares
                    .votes(&key)
                    .filter(|vote| vote.node != primary)
                    .cloned()
                    .collect(),
                request: self.requests.get(&digest).cloned(),
            };
            self.proofs.insert(seq, proof);
            if let Some(slot) = self.slots.get_mut(&seq) {
                slot.prepared = true;
            }
            tracing::debug!(node = %self.identity.name, view = self.view, seq, "prepared");
            self.send_vote(Stage::Commit, seq, digest, out);
        }

        let body_known = digest.is_null() || self.requests.contains_key(&digest);
        if body_known && self.commits.count(&key) >= self.pool.commit_quorum() {
            if let Some(slot) = self.slots.get_mut(&seq) {
                if !slot.committed {
                    slot.committed = true;
                    tracing::debug!(node = %self.identity.name, view = self.view, seq, "committed");
                }
            }
            self.execute_committed(out);
        }
    }

    /// Executes committed slots strictly in sequence order.
    fn execute_committed(&mut self, out: &mut Vec<Output>) {
        loop {
            let seq = self.last_executed + 1;
            let Some(slot) = self.slots.get(&seq) else {
                break;
            };
            if !slot.committed {
                break;
            }
            let digest = slot.digest;
            let request = if digest.is_null() {
                None
            } else {
                match self.requests.get(&digest) {
                    Some(request) => Some(request.clone()),
                    None => break,
                }
            };

            match request {
                Some(request) => {
                    if !self.execute(seq, digest, request, out) {
                        break;
                    }
                }
                None => tracing::debug!(node = %self.identity.name, seq, "null request"),
            }
            self.slots.remove(&seq);
            self.last_executed = seq;
        }

        self.prepares.prune_through(self.last_executed);
        self.commits.prune_through(self.last_executed);
        let keep_from = self.last_executed.saturating_sub(self.config.pipeline_window) + 1;
        self.proofs = self.proofs.split_off(&keep_from);
    }

    /// Executes `request` at `seq` and logs it with its reply. Returns
    /// `false` if the record could not be logged; the sequence number then
    /// stays unexecuted.
    fn execute(&mut self, seq: u64, digest: Digest, request: Request, out: &mut Vec<Output>) -> bool {
        let key = request.key();
        if let Some(earlier) = self.executed.get(&key) {
            tracing::warn!(node = %self.identity.name, seq, earlier, "request already executed, skipping");
            return true;
        }

        let record = OrderedRequestRecord {
            seq,
            client_id: request.client_id.clone(),
            req_id: request.req_id,
            digest,
        };
        let result = self.executor.execute(&record, &request);
        let result = self.behavior.shape_result(&request, result);
        let reply = Reply::new(&self.identity.keypair, self.identity.name.clone(), request.req_id, result);
        if let Err(err) = self.store.append(record, Some(reply.clone())) {
            tracing::error!(node = %self.identity.name, seq, error = %err, "failed to persist ordering record, execution halted");
            return false;
        }

        self.executed.insert(key.clone(), seq);
        self.waiting.remove(&digest);
        self.assigned.remove(&digest);
        self.replies.insert(key, reply.clone());
        tracing::info!(
            node = %self.identity.name,
            seq,
            client = %request.client_id,
            req_id = request.req_id,
            "request finalized"
        );
        out.push(Output::Reply {
            client_id: request.client_id,
            reply,
        });
        true
    }

    fn record_conflict(&mut self, propose: Vote, kind: ConflictKind) {
        match &kind {
            ConflictKind::SlotTaken { existing } => {
                let error = Error::OrderingConflict {
                    seq: propose.seq,
                    view: propose.view,
                    existing: *existing,
                    proposed: propose.digest,
                };
                tracing::warn!(node = %self.identity.name, primary = %propose.node, %error, "conflicting proposal");
            }
            ConflictKind::AlreadyOrdered { at_seq } => {
                tracing::warn!(
                    node = %self.identity.name,
                    primary = %propose.node,
                    seq = propose.seq,
                    at_seq,
                    "proposal reorders an already ordered request"
                );
            }
        }

        let evidence = ConflictEvidence {
            view: propose.view,
            seq: propose.seq,
            proposed: propose.digest,
            kind,
            propose,
        };
        if !self.evidence.contains(&evidence) {
            self.evidence.push(evidence);
        }
        self.suspect = true;
    }

    /// Learns a request carried by a view-change proof.
    pub(super) fn learn_request(&mut self, request: &Request) {
        if let Err(err) = self.authenticator.verify(request) {
            tracing::warn!(node = %self.identity.name, error = %err, "proof carries unauthenticated request");
            return;
        }
        let key = request.key();
        if self.request_keys.contains_key(&key) {
            return;
        }
        let digest = request.hash();
        self.request_keys.insert(key, digest);
        self.requests.insert(digest, request.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::execution::TxnExecutor;
    use crate::consensus::fault::honest;

    const NAMES: [&str; 4] = ["Alpha", "Beta", "Delta", "Gamma"];

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            view_change_timeout_ms: 1_000,
            pipeline_window: 4,
            ..Default::default()
        }
    }

    /// Synchronous pool: outputs are routed to the other engines in order.
    struct Cluster {
        engines: BTreeMap<String, OrderingEngine>,
        secrets: BTreeMap<String, String>,
        offline: HashSet<String>,
        replies: Vec<(String, Reply)>,
        client: Keypair,
        now: Instant,
    }

    impl Cluster {
        fn new() -> Self {
            let keys: BTreeMap<String, Keypair> = NAMES
                .iter()
                .map(|name| (name.to_string(), Keypair::new_pair()))
                .collect();
            let secrets: BTreeMap<String, String> = keys
                .iter()
                .map(|(name, key)| (name.clone(), key.secret_hex()))
                .collect();
            let client = Keypair::new_pair();
            let now = Instant::now();

            let mut engines = BTreeMap::new();
            for (name, keypair) in keys {
                let mut identity = NodeIdentity::new(name.clone(), keypair);
                for (peer, secret) in &secrets {
                    if *peer != name {
                        let key = Keypair::from_secret_hex(secret).unwrap().pubkey();
                        identity.peer_keys.record(peer, key).unwrap();
                    }
                }
                let authenticator = ClientAuthenticator::new();
                authenticator.add_client("client", client.pubkey()).unwrap();
                let mut engine = OrderingEngine::new(
                    identity,
                    Pool::new(NAMES),
                    config(),
                    authenticator,
                    Arc::new(TxnExecutor),
                    honest(),
                    Store::new(),
                );
                engine.start_bootstrap();
                assert!(engine.on_bootstrapped(now).is_empty());
                engines.insert(name, engine);
            }

            Cluster {
                engines,
                secrets,
                offline: HashSet::new(),
                replies: Vec::new(),
                client,
                now,
            }
        }

        fn signer(&self, name: &str) -> Keypair {
            Keypair::from_secret_hex(&self.secrets[name]).unwrap()
        }

        fn engine(&self, name: &str) -> &OrderingEngine {
            &self.engines[name]
        }

        fn request(&self, req_id: u64) -> Request {
            Request::new(&self.client, "client", req_id, json!({"type": "buy", "amount": req_id}))
        }

        fn route(&mut self, from: &str, outputs: Vec<Output>) {
            let mut queue: VecDeque<(String, Output)> =
                outputs.into_iter().map(|output| (from.to_string(), output)).collect();
            while let Some((sender, output)) = queue.pop_front() {
                match output {
                    Output::Reply { reply, .. } => self.replies.push((sender, reply)),
                    Output::Broadcast(message) => {
                        if self.offline.contains(&sender) {
                            continue;
                        }
                        let now = self.now;
                        for (name, engine) in self.engines.iter_mut() {
                            if *name == sender || self.offline.contains(name) {
                                continue;
                            }
                            for output in engine.on_peer_message(message.clone(), now) {
                                queue.push_back((name.clone(), output));
                            }
                        }
                    }
                }
            }
        }

        fn submit(&mut self, request: &Request) {
            let names: Vec<String> = self.engines.keys().cloned().collect();
            for name in names {
                if self.offline.contains(&name) {
                    continue;
                }
                let now = self.now;
                let outputs = self.engines.get_mut(&name).unwrap().on_request(request.clone(), now).unwrap();
                self.route(&name, outputs);
            }
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            let names: Vec<String> = self.engines.keys().cloned().collect();
            for name in names {
                if self.offline.contains(&name) {
                    continue;
                }
                let now = self.now;
                let outputs = self.engines.get_mut(&name).unwrap().tick(now);
                self.route(&name, outputs);
            }
        }

        fn replies_for(&self, req_id: u64) -> Vec<&Reply> {
            self.replies
                .iter()
                .filter(|(_, reply)| reply.req_id == req_id)
                .map(|(_, reply)| reply)
                .collect()
        }
    }

    #[test]
    fn test_orders_and_executes_on_every_node() {
        let mut cluster = Cluster::new();
        for req_id in 1..=3 {
            let request = cluster.request(req_id);
            cluster.submit(&request);
        }

        let reference = cluster.engine("Alpha").records().to_vec();
        assert_eq!(reference.len(), 3);
        assert_eq!(
            reference.iter().map(|record| record.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for name in NAMES {
            assert_eq!(cluster.engine(name).records(), reference.as_slice());
            assert_eq!(cluster.engine(name).state(), NodeState::Ready);
        }
        for req_id in 1..=3 {
            let replies = cluster.replies_for(req_id);
            assert_eq!(replies.len(), 4);
            assert!(replies.iter().all(|reply| reply.result == replies[0].result));
        }
    }

    #[test]
    fn test_duplicate_submission_returns_cached_reply() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        cluster.submit(&request);
        assert_eq!(cluster.replies_for(1).len(), 4);

        cluster.submit(&request);
        assert_eq!(cluster.replies_for(1).len(), 8);
        for name in NAMES {
            assert_eq!(cluster.engine(name).records().len(), 1);
        }
    }

    #[test]
    fn test_rejects_unauthenticated_and_conflicting_requests() {
        let mut cluster = Cluster::new();
        let now = cluster.now;
        let beta = cluster.engines.get_mut("Beta").unwrap();

        let stranger = Request::new(&Keypair::new_pair(), "stranger", 1, json!({}));
        assert!(matches!(beta.on_request(stranger, now), Err(Error::UnknownClient(_))));

        let forged = Request::new(&Keypair::new_pair(), "client", 1, json!({}));
        assert!(matches!(beta.on_request(forged, now), Err(Error::BadSignature(_))));

        let request = cluster.request(7);
        let beta = cluster.engines.get_mut("Beta").unwrap();
        beta.on_request(request, now).unwrap();
        let reuse = Request::new(&cluster.client, "client", 7, json!({"other": true}));
        let beta = cluster.engines.get_mut("Beta").unwrap();
        assert!(matches!(
            beta.on_request(reuse, now),
            Err(Error::RequestConflict { req_id: 7, .. })
        ));
    }

    #[test]
    fn test_propose_is_held_until_request_arrives() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        let alpha = cluster.signer("Alpha");
        let propose = Vote::new(Stage::Propose, &alpha, "Alpha", 0, 1, request.hash());
        let now = cluster.now;

        let beta = cluster.engines.get_mut("Beta").unwrap();
        assert!(beta.on_peer_message(PeerMessage::Propose(propose), now).is_empty());

        let outputs = beta.on_request(request, now).unwrap();
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Broadcast(PeerMessage::Prepare(vote)) if vote.seq == 1)));
    }

    #[test]
    fn test_conflicting_proposals_are_recorded_and_trigger_view_change() {
        let mut cluster = Cluster::new();
        let first = cluster.request(1);
        let second = cluster.request(2);
        let alpha = cluster.signer("Alpha");
        let now = cluster.now;

        let beta = cluster.engines.get_mut("Beta").unwrap();
        beta.on_request(first.clone(), now).unwrap();
        beta.on_request(second.clone(), now).unwrap();

        let propose = |digest| PeerMessage::Propose(Vote::new(Stage::Propose, &alpha, "Alpha", 0, 1, digest));
        let outputs = beta.on_peer_message(propose(first.hash()), now);
        assert_eq!(outputs.len(), 1);
        assert!(beta.on_peer_message(propose(second.hash()), now).is_empty());

        assert_eq!(beta.evidence().len(), 1);
        assert_eq!(
            beta.evidence()[0].kind,
            ConflictKind::SlotTaken {
                existing: first.hash()
            }
        );

        let outputs = beta.tick(now);
        assert_eq!(beta.state(), NodeState::ViewChanging);
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Broadcast(PeerMessage::ViewChange(vc)) if vc.new_view == 1)));
    }

    #[test]
    fn test_execution_follows_sequence_order() {
        let cluster = Cluster::new();
        let first = cluster.request(1);
        let second = cluster.request(2);
        let signers: BTreeMap<&str, Keypair> = NAMES.iter().map(|name| (*name, cluster.signer(name))).collect();
        let mut cluster = cluster;
        let now = cluster.now;
        let gamma = cluster.engines.get_mut("Gamma").unwrap();
        gamma.on_request(first.clone(), now).unwrap();
        gamma.on_request(second.clone(), now).unwrap();

        let finish = |gamma: &mut OrderingEngine, seq: u64, digest: Digest| {
            let mut outputs = gamma.on_peer_message(
                PeerMessage::Propose(Vote::new(Stage::Propose, &signers["Alpha"], "Alpha", 0, seq, digest)),
                now,
            );
            for name in ["Beta", "Delta"] {
                outputs.extend(gamma.on_peer_message(
                    PeerMessage::Prepare(Vote::new(Stage::Prepare, &signers[name], name, 0, seq, digest)),
                    now,
                ));
            }
            for name in ["Alpha", "Beta"] {
                outputs.extend(gamma.on_peer_message(
                    PeerMessage::Commit(Vote::new(Stage::Commit, &signers[name], name, 0, seq, digest)),
                    now,
                ));
            }
            outputs
        };

        let outputs = finish(&mut *gamma, 2, second.hash());
        assert!(!outputs.iter().any(|output| matches!(output, Output::Reply { .. })));
        assert_eq!(gamma.last_executed(), 0);

        let outputs = finish(&mut *gamma, 1, first.hash());
        let replied: Vec<u64> = outputs
            .iter()
            .filter_map(|output| match output {
                Output::Reply { reply, .. } => Some(reply.req_id),
                _ => None,
            })
            .collect();
        assert_eq!(replied, vec![1, 2]);
        assert_eq!(gamma.last_executed(), 2);
    }

    #[test]
    fn test_view_change_replaces_silent_primary() {
        let mut cluster = Cluster::new();
        cluster.offline.insert("Alpha".into());
        let request = cluster.request(1);
        cluster.submit(&request);
        assert!(cluster.replies_for(1).is_empty());

        cluster.advance(Duration::from_millis(1_100));
        for name in ["Beta", "Delta", "Gamma"] {
            let engine = cluster.engine(name);
            assert_eq!(engine.view(), 1, "{name}");
            assert_eq!(engine.state(), NodeState::ViewActive);
            assert_eq!(engine.primary(), "Beta");
            assert_eq!(engine.records().len(), 1);
        }
        let nodes: BTreeSet<&str> = cluster
            .replies
            .iter()
            .map(|(node, _)| node.as_str())
            .collect();
        assert_eq!(nodes, BTreeSet::from(["Beta", "Delta", "Gamma"]));
    }

    #[test]
    fn test_prepared_request_survives_view_change() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        let signers: BTreeMap<&str, Keypair> = NAMES.iter().map(|name| (*name, cluster.signer(name))).collect();
        let digest = request.hash();
        let now = cluster.now;

        // Everyone but Alpha sees the request prepared, but no commits flow.
        for name in ["Beta", "Delta", "Gamma"] {
            let engine = cluster.engines.get_mut(name).unwrap();
            engine.on_request(request.clone(), now).unwrap();
            engine.on_peer_message(
                PeerMessage::Propose(Vote::new(Stage::Propose, &signers["Alpha"], "Alpha", 0, 1, digest)),
                now,
            );
            for voter in ["Beta", "Delta", "Gamma"].into_iter().filter(|voter| *voter != name) {
                engine.on_peer_message(
                    PeerMessage::Prepare(Vote::new(Stage::Prepare, &signers[voter], voter, 0, 1, digest)),
                    now,
                );
            }
            assert!(engine.proofs.contains_key(&1));
            assert_eq!(engine.last_executed(), 0);
        }
        cluster.offline.insert("Alpha".into());

        cluster.advance(Duration::from_millis(1_100));
        for name in ["Beta", "Delta", "Gamma"] {
            let records = cluster.engine(name).records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].seq, 1);
            assert_eq!(records[0].digest, digest);
        }
    }

    #[test]
    fn test_messages_parked_until_bootstrapped() {
        let cluster = Cluster::new();
        let request = cluster.request(1);
        let alpha = cluster.signer("Alpha");
        let now = cluster.now;

        let mut identity = NodeIdentity::new("Beta", cluster.signer("Beta"));
        for name in ["Alpha", "Delta", "Gamma"] {
            identity.peer_keys.record(name, cluster.signer(name).pubkey()).unwrap();
        }
        let authenticator = ClientAuthenticator::new();
        authenticator.add_client("client", cluster.client.pubkey()).unwrap();
        let mut beta = OrderingEngine::new(
            identity,
            Pool::new(NAMES),
            config(),
            authenticator,
            Arc::new(TxnExecutor),
            honest(),
            Store::new(),
        );
        beta.start_bootstrap();

        beta.on_request(request.clone(), now).unwrap();
        let propose = Vote::new(Stage::Propose, &alpha, "Alpha", 0, 1, request.hash());
        assert!(beta.on_peer_message(PeerMessage::Propose(propose), now).is_empty());

        let outputs = beta.on_bootstrapped(now);
        assert_eq!(beta.state(), NodeState::Ready);
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Broadcast(PeerMessage::Prepare(_)))));
    }

    #[test]
    fn test_single_node_pool_orders_alone() {
        let client = Keypair::new_pair();
        let authenticator = ClientAuthenticator::new();
        authenticator.add_client("client", client.pubkey()).unwrap();
        let mut solo = OrderingEngine::new(
            NodeIdentity::new("Solo", Keypair::new_pair()),
            Pool::new(["Solo"]),
            config(),
            authenticator,
            Arc::new(TxnExecutor),
            honest(),
            Store::new(),
        );
        solo.start_bootstrap();
        solo.on_bootstrapped(Instant::now());

        let request = Request::new(&client, "client", 1, json!("ping"));
        let outputs = solo.on_request(request, Instant::now()).unwrap();
        assert!(outputs.iter().any(|output| matches!(output, Output::Reply { .. })));
        assert_eq!(solo.last_executed(), 1);
    }

    #[test]
    fn test_restart_restores_executed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let client = Keypair::new_pair();
        let build = || {
            let authenticator = ClientAuthenticator::new();
            authenticator.add_client("client", client.pubkey()).unwrap();
            let mut engine = OrderingEngine::new(
                NodeIdentity::new("Solo", Keypair::new_pair()),
                Pool::new(["Solo"]),
                config(),
                authenticator,
                Arc::new(TxnExecutor),
                honest(),
                Store::open(dir.path()).unwrap(),
            );
            engine.start_bootstrap();
            engine.on_bootstrapped(Instant::now());
            engine
        };

        let mut engine = build();
        let outputs = engine
            .on_request(Request::new(&client, "client", 1, json!("ping")), Instant::now())
            .unwrap();
        let original = outputs
            .into_iter()
            .find_map(|output| match output {
                Output::Reply { reply, .. } => Some(reply),
                _ => None,
            })
            .unwrap();
        drop(engine);

        let mut engine = build();
        assert_eq!(engine.last_executed(), 1);
        let replay = engine
            .on_request(Request::new(&client, "client", 1, json!("ping")), Instant::now())
            .unwrap();
        assert_eq!(
            replay,
            vec![Output::Reply {
                client_id: "client".into(),
                reply: original,
            }]
        );
        assert_eq!(engine.records().len(), 1);
        assert!(matches!(
            engine.on_request(Request::new(&client, "client", 1, json!("pong")), Instant::now()),
            Err(Error::RequestConflict { .. })
        ));
    }

    #[test]
    fn test_failed_log_write_halts_execution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ordering.log");
        std::fs::write(&path, b"").unwrap();
        let client = Keypair::new_pair();
        let authenticator = ClientAuthenticator::new();
        authenticator.add_client("client", client.pubkey()).unwrap();
        let mut solo = OrderingEngine::new(
            NodeIdentity::new("Solo", Keypair::new_pair()),
            Pool::new(["Solo"]),
            config(),
            authenticator,
            Arc::new(TxnExecutor),
            honest(),
            Store::with_file(std::fs::File::open(&path).unwrap()),
        );
        solo.start_bootstrap();
        solo.on_bootstrapped(Instant::now());

        let request = Request::new(&client, "client", 1, json!("ping"));
        let outputs = solo.on_request(request, Instant::now()).unwrap();
        assert!(!outputs.iter().any(|output| matches!(output, Output::Reply { .. })));
        assert_eq!(solo.last_executed(), 0);
        assert!(solo.records().is_empty());
        assert!(solo.slots.get(&1).is_some_and(|slot| slot.committed));
    }

    #[test]
    fn test_out_of_window_and_unsolicited_null_proposals_are_ignored() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        let alpha = cluster.signer("Alpha");
        let now = cluster.now;
        let propose = |seq, digest| PeerMessage::Propose(Vote::new(Stage::Propose, &alpha, "Alpha", 0, seq, digest));

        let beta = cluster.engines.get_mut("Beta").unwrap();
        for seq in [1, 3, 1_000_000, u64::MAX - 1] {
            assert!(beta.on_peer_message(propose(seq, Digest::NULL), now).is_empty());
        }
        assert!(beta.slots.is_empty());

        beta.on_request(request.clone(), now).unwrap();
        assert!(beta.on_peer_message(propose(5, request.hash()), now).is_empty());
        assert!(beta.slots.is_empty());
        assert!(beta.awaiting_request.is_empty());

        let outputs = beta.on_peer_message(propose(4, request.hash()), now);
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Broadcast(PeerMessage::Prepare(vote)) if vote.seq == 4)));

        // Gaps left by a view change may be filled with nulls.
        beta.refill_through = 3;
        let outputs = beta.on_peer_message(propose(3, Digest::NULL), now);
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Broadcast(PeerMessage::Prepare(vote)) if vote.seq == 3)));
        assert_eq!(beta.slots.len(), 2);
    }

    #[test]
    fn test_proposing_an_ordered_request_again_is_recorded() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        let alpha = cluster.signer("Alpha");
        let now = cluster.now;
        let digest = request.hash();
        let propose = |seq| PeerMessage::Propose(Vote::new(Stage::Propose, &alpha, "Alpha", 0, seq, digest));

        let beta = cluster.engines.get_mut("Beta").unwrap();
        beta.on_request(request, now).unwrap();
        assert_eq!(beta.on_peer_message(propose(1), now).len(), 1);
        assert!(beta.on_peer_message(propose(2), now).is_empty());

        assert_eq!(beta.evidence().len(), 1);
        assert_eq!(beta.evidence()[0].kind, ConflictKind::AlreadyOrdered { at_seq: 1 });
        assert!(!beta.slots.contains_key(&2));
        beta.tick(now);
        assert_eq!(beta.state(), NodeState::ViewChanging);
    }

    #[test]
    fn test_lagging_node_joins_the_active_view() {
        let mut cluster = Cluster::new();
        let request = cluster.request(1);
        let digest = request.hash();
        let signers: BTreeMap<&str, Keypair> = NAMES.iter().map(|name| (*name, cluster.signer(name))).collect();
        let now = cluster.now;
        let vote = |stage, name: &str| Vote::new(stage, &signers[name], name, 1, 1, digest);

        let gamma = cluster.engines.get_mut("Gamma").unwrap();
        gamma.on_request(request, now).unwrap();

        // The others moved to view 1 (led by Beta) while Gamma was away.
        let mut outputs = gamma.on_peer_message(PeerMessage::Propose(vote(Stage::Propose, "Beta")), now);
        assert_eq!(gamma.view(), 0);
        outputs.extend(gamma.on_peer_message(PeerMessage::Prepare(vote(Stage::Prepare, "Alpha")), now));
        assert_eq!(gamma.view(), 1);
        assert_eq!(gamma.state(), NodeState::ViewActive);
        assert_eq!(gamma.primary(), "Beta");

        outputs.extend(gamma.on_peer_message(PeerMessage::Prepare(vote(Stage::Prepare, "Delta")), now));
        for name in ["Alpha", "Beta"] {
            outputs.extend(gamma.on_peer_message(PeerMessage::Commit(vote(Stage::Commit, name)), now));
        }
        assert!(outputs
            .iter()
            .any(|output| matches!(output, Output::Reply { reply, .. } if reply.req_id == 1)));
        assert_eq!(gamma.last_executed(), 1);
    }

    #[test]
    fn test_one_voice_from_a_higher_view_is_not_enough() {
        let mut cluster = Cluster::new();
        let delta = cluster.signer("Delta");
        let now = cluster.now;
        let gamma = cluster.engines.get_mut("Gamma").unwrap();

        for seq in 1..=3 {
            let vote = Vote::new(Stage::Commit, &delta, "Delta", 7, seq, Digest::NULL);
            gamma.on_peer_message(PeerMessage::Commit(vote), now);
        }
        let forged = Vote::new(Stage::Commit, &Keypair::new_pair(), "Alpha", 7, 1, Digest::NULL);
        gamma.on_peer_message(PeerMessage::Commit(forged), now);
        assert_eq!(gamma.view(), 0);
        assert_eq!(gamma.state(), NodeState::Ready);
    }
}
