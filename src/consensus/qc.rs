use std::collections::{BTreeMap, HashMap};

use super::message::{NodeName, PreparedProof, Stage, Vote};
use super::peers::{NodeIdentity, Pool};
use crate::common::crypto::{Digest, Hashable};

/// What a vote is about.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct VoteKey {
    pub view: u64,
    pub seq: u64,
    pub digest: Digest,
}

impl From<&Vote> for VoteKey {
    fn from(vote: &Vote) -> Self {
        VoteKey {
            view: vote.view,
            seq: vote.seq,
            digest: vote.digest,
        }
    }
}

/// Signed votes of one stage, grouped by subject and keyed by voter so
/// duplicates collapse.
#[derive(Debug, Default)]
pub struct VoteBook {
    votes: HashMap<VoteKey, BTreeMap<NodeName, Vote>>,
}

impl VoteBook {
    /// Returns `false` if this voter already voted for the same subject.
    pub fn add(&mut self, vote: Vote) -> bool {
        let voters = self.votes.entry(VoteKey::from(&vote)).or_default();
        if voters.contains_key(&vote.node) {
            return false;
        }
        voters.insert(vote.node.clone(), vote);
        true
    }

    pub fn count(&self, key: &VoteKey) -> usize {
        self.votes.get(key).map_or(0, BTreeMap::len)
    }

    /// Votes for `key`, skipping the given voter.
    pub fn count_excluding(&self, key: &VoteKey, excluded: &str) -> usize {
        self.votes.get(key).map_or(0, |voters| {
            voters.keys().filter(|voter| voter.as_str() != excluded).count()
        })
    }

    pub fn votes(&self, key: &VoteKey) -> impl Iterator<Item = &Vote> {
        self.votes.get(key).into_iter().flat_map(|voters| voters.values())
    }

    /// Drops every subject whose sequence number is at or below `seq`.
    pub fn prune_through(&mut self, seq: u64) {
        self.votes.retain(|key, _| key.seq > seq);
    }

    /// Drops every subject from views older than `view`.
    pub fn prune_views_before(&mut self, view: u64) {
        self.votes.retain(|key, _| key.view >= view);
    }
}

impl PreparedProof {
    /// Checks that the proof carries a Propose signed by the primary of its
    /// view and `2f` matching Prepares from distinct backups, all with valid
    /// signatures, and that the request body matches the digest.
    pub fn validate(&self, pool: &Pool, identity: &NodeIdentity) -> bool {
        let primary = pool.get_leader(self.view());
        if self.propose.node != primary {
            tracing::debug!(seq = self.seq(), "proof failed: propose not from primary");
            return false;
        }
        let Some(primary_key) = identity.key_of(primary) else {
            return false;
        };
        if !self.propose.verify(Stage::Propose, &primary_key) {
            tracing::debug!(seq = self.seq(), "proof failed: bad propose signature");
            return false;
        }

        match &self.request {
            Some(request) if request.hash() != self.digest() => {
                tracing::debug!(seq = self.seq(), "proof failed: request does not match digest");
                return false;
            }
            None if !self.digest().is_null() => {
                tracing::debug!(seq = self.seq(), "proof failed: missing request body");
                return false;
            }
            _ => {}
        }

        let mut voters = std::collections::BTreeSet::new();
        for prepare in &self.prepares {
            if !prepare.matches(&self.propose) || prepare.node == primary || !pool.is_member(&prepare.node) {
                continue;
            }
            let Some(key) = identity.key_of(&prepare.node) else {
                continue;
            };
            if prepare.verify(Stage::Prepare, &key) {
                voters.insert(prepare.node.as_str());
            }
        }

        if voters.len() < pool.prepare_quorum() {
            tracing::debug!(seq = self.seq(), have = voters.len(), "proof failed: not enough prepares");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::message::Request;

    struct Fixture {
        pool: Pool,
        keys: Vec<(String, Keypair)>,
    }

    fn fixture() -> Fixture {
        let names = ["Alpha", "Beta", "Delta", "Gamma"];
        Fixture {
            pool: Pool::new(names),
            keys: names
                .iter()
                .map(|name| (name.to_string(), Keypair::new_pair()))
                .collect(),
        }
    }

    impl Fixture {
        fn key(&self, name: &str) -> &Keypair {
            &self.keys.iter().find(|(n, _)| n == name).unwrap().1
        }

        fn observer(&self) -> NodeIdentity {
            let own = Keypair::from_secret_hex(&self.key("Gamma").secret_hex()).unwrap();
            let mut identity = NodeIdentity::new("Gamma", own);
            for (name, key) in &self.keys {
                if name != "Gamma" {
                    identity.peer_keys.record(name, key.pubkey()).unwrap();
                }
            }
            identity
        }
    }

    fn proof(fx: &Fixture, preparers: &[&str]) -> PreparedProof {
        let client = Keypair::new_pair();
        let request = Request::new(&client, "c", 1, json!({"life_answer": 42}));
        let digest = request.hash();
        PreparedProof {
            propose: Vote::new(Stage::Propose, fx.key("Alpha"), "Alpha", 0, 1, digest),
            prepares: preparers
                .iter()
                .map(|name| Vote::new(Stage::Prepare, fx.key(name), name, 0, 1, digest))
                .collect(),
            request: Some(request),
        }
    }

    #[test]
    fn test_vote_book_dedups_voters() {
        let keypair = Keypair::new_pair();
        let vote = Vote::new(Stage::Prepare, &keypair, "Beta", 0, 1, Digest::NULL);
        let key = VoteKey::from(&vote);

        let mut book = VoteBook::default();
        assert!(book.add(vote.clone()));
        assert!(!book.add(vote));
        assert!(book.add(Vote::new(Stage::Prepare, &keypair, "Gamma", 0, 1, Digest::NULL)));
        assert_eq!(book.count(&key), 2);
        assert_eq!(book.count_excluding(&key, "Gamma"), 1);

        book.prune_through(1);
        assert_eq!(book.count(&key), 0);
    }

    #[test]
    fn test_validate_prepared_proof() {
        let fx = fixture();
        let observer = fx.observer();

        assert!(proof(&fx, &["Beta", "Gamma"]).validate(&fx.pool, &observer));
        assert!(!proof(&fx, &["Beta"]).validate(&fx.pool, &observer));
        // The primary's own Prepare does not count.
        assert!(!proof(&fx, &["Beta", "Alpha"]).validate(&fx.pool, &observer));
        // Duplicate voter only counts once.
        assert!(!proof(&fx, &["Beta", "Beta"]).validate(&fx.pool, &observer));
    }

    #[test]
    fn test_validate_rejects_forgery() {
        let fx = fixture();
        let observer = fx.observer();

        let mut wrong_primary = proof(&fx, &["Beta", "Gamma"]);
        wrong_primary.propose = Vote::new(
            Stage::Propose,
            fx.key("Beta"),
            "Beta",
            0,
            1,
            wrong_primary.digest(),
        );
        assert!(!wrong_primary.validate(&fx.pool, &observer));

        let mut swapped = proof(&fx, &["Beta", "Gamma"]);
        swapped.request = Some(Request::new(&Keypair::new_pair(), "c", 2, json!({})));
        assert!(!swapped.validate(&fx.pool, &observer));
    }
}
