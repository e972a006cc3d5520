//! Replacing a primary that stalls or equivocates.
//!
//! `f+1` matching votes for a higher view activate it. The new primary
//! re-proposes everything the votes prove prepared, fills gaps with null
//! requests and then resumes normal ordering. A node stuck waiting for
//! activation escalates to the next view with a doubled timeout. A node that
//! missed the view change (after a restart, say) joins the view once `f+1`
//! members are seen ordering in it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use super::engine::{NodeState, OrderingEngine, Output};
use super::message::{NodeName, PeerMessage, PreparedProof, ViewChange};
use super::peers::Role;
use crate::common::crypto::Digest;

/// Escalations beyond this many keep the same timeout.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Default)]
pub struct ViewChangeState {
    votes: BTreeMap<u64, BTreeMap<NodeName, ViewChange>>,
    target: Option<u64>,
    started_at: Option<Instant>,
    attempt: u32,
}

impl ViewChangeState {
    /// Records a vote and returns how many distinct nodes voted for its view.
    fn record(&mut self, view_change: ViewChange) -> usize {
        let voters = self.votes.entry(view_change.new_view).or_default();
        voters.insert(view_change.node.clone(), view_change);
        voters.len()
    }

    fn has_voted(&self, view: u64, node: &str) -> bool {
        self.votes
            .get(&view)
            .is_some_and(|voters| voters.contains_key(node))
    }

    fn votes_for(&self, view: u64) -> Vec<ViewChange> {
        self.votes
            .get(&view)
            .map(|voters| voters.values().cloned().collect())
            .unwrap_or_default()
    }

    fn timeout(&self, base: Duration) -> Duration {
        base * 2u32.pow(self.attempt.min(MAX_BACKOFF_EXPONENT))
    }

    /// Clears the attempt once `view` is active.
    fn finish(&mut self, view: u64) {
        self.votes = self.votes.split_off(&(view + 1));
        self.target = None;
        self.started_at = None;
        self.attempt = 0;
    }
}

impl OrderingEngine {
    /// Votes to move to `new_view`.
    pub(super) fn start_view_change(&mut self, new_view: u64, now: Instant, out: &mut Vec<Output>) {
        self.state = NodeState::ViewChanging;
        self.view_change.target = Some(new_view);
        self.view_change.started_at = Some(now);

        let proof: Vec<PreparedProof> = self.proofs.values().cloned().collect();
        let view_change = ViewChange::new(
            &self.identity.keypair,
            &self.identity.name,
            new_view,
            self.last_executed,
            proof,
        );
        tracing::info!(
            node = %self.identity.name,
            view = self.view,
            new_view,
            last_stable_seq = self.last_executed,
            proofs = view_change.proof.len(),
            "starting view change"
        );
        out.push(Output::Broadcast(PeerMessage::ViewChange(view_change.clone())));
        self.register_view_change(view_change, now, out);
    }

    pub(super) fn on_view_change(&mut self, view_change: ViewChange, now: Instant, out: &mut Vec<Output>) {
        if view_change.new_view <= self.view {
            tracing::debug!(node = %self.identity.name, new_view = view_change.new_view, "stale view change");
            return;
        }
        if view_change.node == self.identity.name || !self.pool.is_member(&view_change.node) {
            return;
        }
        let verified = self
            .identity
            .key_of(&view_change.node)
            .is_some_and(|key| view_change.verify(&key));
        if !verified {
            tracing::warn!(node = %self.identity.name, from = %view_change.node, "view change with bad signature");
            return;
        }
        if let Some(bad) = view_change
            .proof
            .iter()
            .find(|proof| !proof.validate(&self.pool, &self.identity))
        {
            tracing::warn!(
                node = %self.identity.name,
                from = %view_change.node,
                seq = bad.seq(),
                "view change carries an invalid prepared proof"
            );
            return;
        }
        self.register_view_change(view_change, now, out);
    }

    fn register_view_change(&mut self, view_change: ViewChange, now: Instant, out: &mut Vec<Output>) {
        let new_view = view_change.new_view;
        for proof in &view_change.proof {
            if let Some(request) = &proof.request {
                self.learn_request(request);
            }
        }

        let votes = self.view_change.record(view_change);
        tracing::debug!(node = %self.identity.name, new_view, votes, "view change vote");
        if votes < self.pool.weak_quorum() || new_view <= self.view {
            return;
        }
        if !self.view_change.has_voted(new_view, &self.identity.name) {
            // Our own vote registers and activates the view.
            self.start_view_change(new_view, now, out);
            return;
        }
        self.activate_view(new_view, now, out);
    }

    fn activate_view(&mut self, new_view: u64, now: Instant, out: &mut Vec<Output>) {
        let old_view = self.view;
        let reports = self.view_change.votes_for(new_view);
        self.enter_view(new_view, now);
        self.refill_through = self.reproposal_high(&reports);

        tracing::info!(
            node = %self.identity.name,
            old_view,
            view = new_view,
            primary = self.primary(),
            "view activated"
        );
        if self.role() == Role::Primary {
            self.repropose(&reports, out);
        }
        self.replay_parked(now, out);
        self.try_propose(out);
    }

    /// Joins `new_view` without a local view change. The re-proposals were
    /// sent before we got here, so nulls are accepted across the window.
    pub(super) fn adopt_view(&mut self, new_view: u64, now: Instant, out: &mut Vec<Output>) {
        let old_view = self.view;
        self.enter_view(new_view, now);
        self.refill_through = self.last_executed + self.config.pipeline_window;

        tracing::info!(
            node = %self.identity.name,
            old_view,
            view = new_view,
            primary = self.primary(),
            "joined view already active in the pool"
        );
        self.replay_parked(now, out);
        self.try_propose(out);
    }

    fn enter_view(&mut self, new_view: u64, now: Instant) {
        self.view_change.finish(new_view);
        self.ahead = self.ahead.split_off(&(new_view + 1));
        self.view = new_view;
        self.state = NodeState::ViewActive;
        self.suspect = false;

        // Only committed slots survive; everything else goes back in line.
        let discarded: Vec<Digest> = self
            .slots
            .values()
            .filter(|slot| !slot.committed)
            .map(|slot| slot.digest)
            .collect();
        self.slots.retain(|_, slot| slot.committed);
        self.assigned.retain(|_, seq| self.slots.contains_key(seq));
        for digest in discarded.into_iter().rev() {
            let unexecuted = self
                .requests
                .get(&digest)
                .is_some_and(|request| !self.executed.contains_key(&request.key()));
            if unexecuted && !self.pending.contains(&digest) {
                self.pending.push_front(digest);
            }
        }
        self.awaiting_request.clear();
        self.prepares.prune_views_before(new_view);
        self.commits.prune_views_before(new_view);

        let deadline = now + self.config.view_change_timeout();
        for entry in self.waiting.values_mut() {
            *entry = deadline;
        }
    }

    /// The highest sequence number the reports prove prepared, or that we
    /// committed or executed ourselves.
    fn reproposal_high(&self, reports: &[ViewChange]) -> u64 {
        reports
            .iter()
            .flat_map(|report| report.proof.iter())
            .map(PreparedProof::seq)
            .chain(self.slots.keys().next_back().copied())
            .chain([self.last_executed])
            .max()
            .unwrap_or(0)
    }

    /// Re-proposes, from the lowest reported stable sequence upwards, the
    /// highest-view prepared digest of every sequence number, our own record
    /// where no proof exists, or a null request.
    fn repropose(&mut self, reports: &[ViewChange], out: &mut Vec<Output>) {
        let low = reports
            .iter()
            .map(|report| report.last_stable_seq)
            .min()
            .unwrap_or(self.last_executed)
            + 1;

        let mut chosen: BTreeMap<u64, &PreparedProof> = BTreeMap::new();
        for proof in reports.iter().flat_map(|report| report.proof.iter()) {
            if proof.seq() < low {
                continue;
            }
            match chosen.get(&proof.seq()) {
                Some(existing) if existing.view() >= proof.view() => {}
                _ => {
                    chosen.insert(proof.seq(), proof);
                }
            }
        }

        let high = self.reproposal_high(reports);

        let mut proposals = Vec::new();
        for seq in low..=high {
            let digest = if let Some(proof) = chosen.get(&seq) {
                proof.digest()
            } else if let Some(record) = self.store.get(seq) {
                record.digest
            } else if let Some(slot) = self.slots.get(&seq) {
                slot.digest
            } else {
                Digest::NULL
            };
            proposals.push((seq, digest));
        }

        tracing::info!(
            node = %self.identity.name,
            view = self.view,
            from_seq = low,
            to_seq = high,
            proven = chosen.len(),
            "re-proposing after view change"
        );
        for (seq, digest) in proposals {
            self.pending.retain(|pending| *pending != digest);
            self.propose(seq, digest, out);
        }
        self.next_seq = high + 1;
    }

    pub(super) fn check_escalation(&mut self, now: Instant, out: &mut Vec<Output>) {
        let (Some(target), Some(started_at)) = (self.view_change.target, self.view_change.started_at) else {
            return;
        };
        let timeout = self.view_change.timeout(self.config.view_change_timeout());
        if now.duration_since(started_at) < timeout {
            return;
        }
        self.view_change.attempt += 1;
        tracing::warn!(
            node = %self.identity.name,
            target,
            next = target + 1,
            waited_ms = timeout.as_millis() as u64,
            "view change stalled, escalating"
        );
        self.start_view_change(target + 1, now, out);
    }
}
