use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::crypto::{Keypair, Pubkey};
use crate::common::error::{Error, Result};
use super::message::NodeName;

/// The fixed membership of the pool and its quorum arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub members: Vec<NodeName>,
}

impl Pool {
    /// Members are kept in sorted order so every participant derives the
    /// same primary for a view.
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeName>,
    {
        let mut members: Vec<NodeName> = members.into_iter().map(Into::into).collect();
        members.sort();
        members.dedup();
        Pool { members }
    }

    pub fn n(&self) -> usize {
        self.members.len()
    }

    /// Maximum number of faulty nodes tolerated.
    pub fn f(&self) -> usize {
        self.n().saturating_sub(1) / 3
    }

    /// Matching Prepares (besides the Propose) needed to prepare.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f()
    }

    pub fn commit_quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// Votes needed to activate a new view, and matching replies a client
    /// needs.
    pub fn weak_quorum(&self) -> usize {
        self.f() + 1
    }

    /// Smallest number of live nodes that still guarantees progress.
    pub fn live_quorum(&self) -> usize {
        self.n() - self.f()
    }

    pub fn get_leader(&self, view_num: u64) -> &str {
        &self.members[view_num as usize % self.members.len()]
    }

    pub fn is_member(&self, name: &str) -> bool {
        self.members.iter().any(|member| member == name)
    }

    /// Every member except `me`.
    pub fn others<'a>(&'a self, me: &'a str) -> impl Iterator<Item = &'a NodeName> + 'a {
        self.members.iter().filter(move |member| member.as_str() != me)
    }
}

/// Verification keys of the other pool members, learnt during bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyRegistry {
    keys: BTreeMap<NodeName, Pubkey>,
}

impl PeerKeyRegistry {
    /// Records `key` for `name` on first use. Returns `true` if the key is
    /// new, `false` if it was already known.
    pub fn record(&mut self, name: &str, key: Pubkey) -> Result<bool> {
        match self.keys.get(name) {
            Some(existing) if *existing == key => Ok(false),
            Some(_) => Err(Error::KeySubstitution(name.to_string())),
            None => {
                self.keys.insert(name.to_string(), key);
                Ok(true)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Pubkey> {
        self.keys.get(name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

/// A node's own identity: name, signing key and the keys of its peers.
#[derive(Debug)]
pub struct NodeIdentity {
    pub name: NodeName,
    pub keypair: Keypair,
    pub peer_keys: PeerKeyRegistry,
}

impl NodeIdentity {
    pub fn new(name: impl Into<NodeName>, keypair: Keypair) -> Self {
        NodeIdentity {
            name: name.into(),
            keypair,
            peer_keys: PeerKeyRegistry::default(),
        }
    }

    pub fn role(&self, pool: &Pool, view: u64) -> Role {
        if pool.get_leader(view) == self.name {
            Role::Primary
        } else {
            Role::Backup
        }
    }

    /// Key of `name`, including our own.
    pub fn key_of(&self, name: &str) -> Option<Pubkey> {
        if name == self.name {
            Some(self.keypair.pubkey())
        } else {
            self.peer_keys.get(name).copied()
        }
    }
}
