//! Pool and client configuration.
//!
//! The host application supplies the registries; they can be built in code
//! or loaded from JSON files.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Suffix of a node's client-facing endpoint name (`Alpha` → `AlphaC`).
pub const CLIENT_ENDPOINT_SUFFIX: &str = "C";

/// Name of the client-facing endpoint of `node`.
pub fn client_endpoint(node: &str) -> String {
    format!("{node}{CLIENT_ENDPOINT_SUFFIX}")
}

/// Protocol timings and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a backup waits for progress on a pending request before
    /// suspecting the primary.
    pub view_change_timeout_ms: u64,
    /// Maximum number of proposed but not yet executed sequence numbers.
    pub pipeline_window: u64,
    /// First key re-announcement interval.
    pub bootstrap_retry_initial_ms: u64,
    /// Upper bound of the re-announcement backoff.
    pub bootstrap_retry_max_ms: u64,
    /// Give up re-announcing after this long.
    pub bootstrap_timeout_ms: u64,
    /// Timer resolution of the node actor.
    pub tick_interval_ms: u64,
    /// A peer counts as live if heard from within this window.
    pub liveness_window_ms: u64,
    /// Peer messages buffered while bootstrapping.
    pub max_parked_messages: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            view_change_timeout_ms: 4_000,
            pipeline_window: 16,
            bootstrap_retry_initial_ms: 100,
            bootstrap_retry_max_ms: 2_000,
            bootstrap_timeout_ms: 30_000,
            tick_interval_ms: 50,
            liveness_window_ms: 10_000,
            max_parked_messages: 1_024,
        }
    }
}

impl ProtocolConfig {
    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }

    pub fn bootstrap_retry_initial(&self) -> Duration {
        Duration::from_millis(self.bootstrap_retry_initial_ms)
    }

    pub fn bootstrap_retry_max(&self) -> Duration {
        Duration::from_millis(self.bootstrap_retry_max_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

/// Configuration of the whole pool, shared by every node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Node name → peer-facing address.
    pub node_reg: BTreeMap<String, SocketAddr>,
    /// Node name → client-facing address.
    #[serde(default)]
    pub client_reg: BTreeMap<String, SocketAddr>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Root directory for persisted keys and ordering logs.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl PoolConfig {
    /// Builds a config for an in-memory pool where addresses are unused.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unspecified = SocketAddr::from(([127, 0, 0, 1], 0));
        let node_reg = names
            .into_iter()
            .map(|name| (name.into(), unspecified))
            .collect();
        Self {
            node_reg,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: PoolConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_reg.is_empty() {
            return Err(Error::Config("node registry is empty".into()));
        }
        if let Some(name) = self.node_reg.keys().find(|name| name.is_empty()) {
            return Err(Error::Config(format!("invalid node name {name:?}")));
        }
        for name in self.client_reg.keys() {
            if !self.node_reg.contains_key(name) {
                return Err(Error::Config(format!(
                    "client registry names unknown node {name}"
                )));
            }
        }
        if self.protocol.pipeline_window == 0 {
            return Err(Error::Config("pipeline window must be positive".into()));
        }
        Ok(())
    }

    /// Node names in pool order.
    pub fn names(&self) -> Vec<String> {
        self.node_reg.keys().cloned().collect()
    }

    pub fn node_dir(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }

    /// The registry a client needs to reach this pool.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::for_nodes(self.names());
        for (name, addr) in &self.client_reg {
            config.node_reg.insert(name.clone(), *addr);
        }
        config
    }
}

/// Client-side view of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Node name → client-facing address.
    pub node_reg: BTreeMap<String, SocketAddr>,
    /// How long `get_reply` waits for a quorum of matching replies.
    #[serde(default = "default_reply_deadline_ms")]
    pub reply_deadline_ms: u64,
}

fn default_reply_deadline_ms() -> u64 {
    10_000
}

impl ClientConfig {
    /// Registry for an in-memory pool where addresses are unused.
    pub fn for_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unspecified = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            node_reg: names
                .into_iter()
                .map(|name| (name.into(), unspecified))
                .collect(),
            reply_deadline_ms: default_reply_deadline_ms(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        if config.node_reg.is_empty() {
            return Err(Error::Config("client node registry is empty".into()));
        }
        Ok(config)
    }

    pub fn reply_deadline(&self) -> Duration {
        Duration::from_millis(self.reply_deadline_ms)
    }

    pub fn names(&self) -> Vec<String> {
        self.node_reg.keys().cloned().collect()
    }
}
