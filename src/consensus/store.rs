//! Persistent node state: the append-only ordering log with the signed
//! reply of every executed request, the peer-key registry and the node's
//! signing key.
//!
//! Without a data directory everything lives in memory only.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::message::{ClientId, Reply, RequestKey};
use super::peers::PeerKeyRegistry;
use crate::common::crypto::{Digest, Keypair};
use crate::common::error::Result;

const ORDERING_LOG_FILE: &str = "ordering.log";
const PEER_KEYS_FILE: &str = "peer_keys.json";
const IDENTITY_FILE: &str = "identity.json";

/// A request whose position in the total order has been finalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedRequestRecord {
    pub seq: u64,
    pub client_id: ClientId,
    pub req_id: u64,
    pub digest: Digest,
}

impl OrderedRequestRecord {
    pub fn key(&self) -> RequestKey {
        RequestKey {
            client_id: self.client_id.clone(),
            req_id: self.req_id,
        }
    }
}

/// One line of the ordering log.
#[derive(Serialize, Deserialize)]
struct LogEntry {
    #[serde(flatten)]
    record: OrderedRequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply: Option<Reply>,
}

/// Append-only log of finalized records.
pub struct Store {
    records: Vec<OrderedRequestRecord>,
    replies: HashMap<u64, Reply>,
    file: Option<File>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            records: Vec::new(),
            replies: HashMap::new(),
            file: None,
        }
    }

    /// Opens the log under `dir`, replaying records written by a previous
    /// run.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(ORDERING_LOG_FILE);

        let mut store = Store::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)?;
                store.push(entry);
            }
        }

        store.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        tracing::debug!(path = %path.display(), records = store.records.len(), "opened ordering log");
        Ok(store)
    }

    /// Writes the record and the reply sent for it. Nothing is kept in
    /// memory unless the write succeeded.
    pub fn append(&mut self, record: OrderedRequestRecord, reply: Option<Reply>) -> Result<()> {
        let entry = LogEntry { record, reply };
        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
        }
        self.push(entry);
        Ok(())
    }

    fn push(&mut self, entry: LogEntry) {
        if let Some(reply) = entry.reply {
            self.replies.insert(entry.record.seq, reply);
        }
        self.records.push(entry.record);
    }

    pub fn records(&self) -> &[OrderedRequestRecord] {
        &self.records
    }

    pub fn get(&self, seq: u64) -> Option<&OrderedRequestRecord> {
        self.records.iter().rev().find(|record| record.seq == seq)
    }

    /// The reply logged for the request executed at `seq`.
    pub fn reply(&self, seq: u64) -> Option<&Reply> {
        self.replies.get(&seq)
    }

    pub fn last_seq(&self) -> u64 {
        self.records.iter().map(|record| record.seq).max().unwrap_or(0)
    }

    /// A log writing to `file`, for exercising write failures.
    #[cfg(test)]
    pub(crate) fn with_file(file: File) -> Self {
        Store {
            file: Some(file),
            ..Store::new()
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a node keeps its key material, if anywhere.
#[derive(Clone, Debug, Default)]
pub struct KeyStore {
    dir: Option<PathBuf>,
}

impl KeyStore {
    pub fn in_memory() -> Self {
        KeyStore { dir: None }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        KeyStore {
            dir: Some(dir.into()),
        }
    }

    /// Loads the node's signing key, generating and saving one on first use.
    pub fn load_or_create_identity(&self) -> Result<Keypair> {
        let Some(dir) = &self.dir else {
            return Ok(Keypair::new_pair());
        };
        let path = dir.join(IDENTITY_FILE);
        if path.exists() {
            let stored: StoredIdentity = serde_json::from_str(&fs::read_to_string(&path)?)?;
            return Keypair::from_secret_hex(&stored.secret);
        }

        fs::create_dir_all(dir)?;
        let keypair = Keypair::new_pair();
        let stored = StoredIdentity {
            secret: keypair.secret_hex(),
        };
        fs::write(&path, serde_json::to_vec_pretty(&stored)?)?;
        Ok(keypair)
    }

    pub fn load_peer_keys(&self) -> Result<PeerKeyRegistry> {
        let Some(dir) = &self.dir else {
            return Ok(PeerKeyRegistry::default());
        };
        let path = dir.join(PEER_KEYS_FILE);
        if !path.exists() {
            return Ok(PeerKeyRegistry::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save_peer_keys(&self, registry: &PeerKeyRegistry) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{PEER_KEYS_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(registry)?)?;
        fs::rename(tmp, dir.join(PEER_KEYS_FILE))?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret: String,
}
