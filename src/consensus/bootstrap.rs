//! Key sharing among pool members.
//!
//! Each node announces its verification key to every peer and re-announces
//! with exponential backoff until every peer has acknowledged. A peer that
//! announces itself before acknowledging us gets our announcement back,
//! even after the retry timeout, so late starters still complete. Keys are
//! accepted trust-on-first-use; this is a convenience bootstrap, not a
//! secure channel establishment.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use super::message::{KeyAnnounce, NodeName};
use super::peers::{PeerKeyRegistry, Pool};
use crate::common::error::{Error, Result};
use crate::config::ProtocolConfig;

#[derive(Debug)]
pub struct KeySharing {
    me: NodeName,
    peers: Vec<NodeName>,
    acked: BTreeSet<NodeName>,
    started_at: Option<Instant>,
    next_announce: Option<Instant>,
    backoff: Duration,
    max_backoff: Duration,
    timeout: Duration,
    timed_out: bool,
}

impl KeySharing {
    pub fn new(pool: &Pool, me: &str, config: &ProtocolConfig) -> Self {
        KeySharing {
            me: me.to_string(),
            peers: pool.others(me).cloned().collect(),
            acked: BTreeSet::new(),
            started_at: None,
            next_announce: None,
            backoff: config.bootstrap_retry_initial(),
            max_backoff: config.bootstrap_retry_max(),
            timeout: config.bootstrap_timeout(),
            timed_out: false,
        }
    }

    /// Starts announcing. Returns `false` if key sharing was already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(now);
        self.next_announce = Some(now);
        true
    }

    fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Peers to (re-)announce to at `now`. Empty when nothing is due.
    pub fn due_announcements(&mut self, now: Instant) -> Vec<NodeName> {
        let (Some(started_at), Some(next)) = (self.started_at, self.next_announce) else {
            return Vec::new();
        };
        if self.timed_out || self.all_acked() || now < next {
            return Vec::new();
        }
        if now.duration_since(started_at) >= self.timeout {
            self.timed_out = true;
            tracing::error!(
                node = %self.me,
                missing = ?self.unacked(),
                timeout_ms = self.timeout.as_millis() as u64,
                "key sharing timed out; pool peers unreachable"
            );
            return Vec::new();
        }

        self.next_announce = Some(now + self.backoff);
        self.backoff = (self.backoff * 2).min(self.max_backoff);
        self.unacked()
    }

    /// Handles an announcement (or an acknowledgement, which carries the
    /// acknowledger's key too). Returns whether the key was new.
    pub fn on_announce(
        &mut self,
        registry: &mut PeerKeyRegistry,
        announce: &KeyAnnounce,
        is_ack: bool,
    ) -> Result<bool> {
        let name = announce.node_name.as_str();
        if name == self.me || !self.peers.iter().any(|peer| peer == name) {
            return Err(Error::UnknownPeer(name.to_string()));
        }
        if !announce.verify(is_ack) {
            return Err(Error::BadSignature(name.to_string()));
        }

        let is_new = registry.record(name, announce.ver_key)?;
        if is_new {
            tracing::debug!(node = %self.me, peer = name, "learnt peer key");
        }
        if is_ack && self.acked.insert(name.to_string()) {
            tracing::debug!(node = %self.me, peer = name, acked = self.acked.len(), "key acknowledged");
        }
        Ok(is_new)
    }

    /// Whether an announcement from `peer` is answered with our own
    /// announcement besides the ack.
    pub fn should_announce_to(&self, peer: &str) -> bool {
        self.is_started() && !self.acked.contains(peer) && self.peers.iter().any(|known| known == peer)
    }

    fn all_acked(&self) -> bool {
        self.acked.len() == self.peers.len()
    }

    fn unacked(&self) -> Vec<NodeName> {
        self.peers
            .iter()
            .filter(|peer| !self.acked.contains(*peer))
            .cloned()
            .collect()
    }

    /// Bootstrap is complete once every peer's key is known and every peer
    /// has acknowledged ours.
    pub fn is_complete(&self, registry: &PeerKeyRegistry) -> bool {
        self.all_acked() && self.peers.iter().all(|peer| registry.get(peer).is_some())
    }
}
