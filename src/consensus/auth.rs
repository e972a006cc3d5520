//! Client key registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::crypto::Pubkey;
use crate::common::error::{Error, Result};
use super::message::{ClientId, Request};

/// Validates that requests are signed by a registered client.
///
/// Cloning yields another handle to the same registry, so the host can keep
/// registering clients while the node actor verifies requests.
#[derive(Debug, Clone, Default)]
pub struct ClientAuthenticator {
    clients: Arc<RwLock<HashMap<ClientId, Pubkey>>>,
}

impl ClientAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` with `key`. Registration is append-only: repeating an
    /// identical pair is a no-op, rebinding `id` to another key fails.
    pub fn add_client(&self, id: &str, key: Pubkey) -> Result<()> {
        let mut clients = self.clients.write();
        match clients.get(id) {
            Some(existing) if *existing == key => Ok(()),
            Some(_) => {
                tracing::warn!(client = id, "rejected client key substitution");
                Err(Error::KeySubstitution(id.to_string()))
            }
            None => {
                clients.insert(id.to_string(), key);
                tracing::debug!(client = id, "client registered");
                Ok(())
            }
        }
    }

    pub fn verify(&self, request: &Request) -> Result<()> {
        let key = self
            .clients
            .read()
            .get(&request.client_id)
            .copied()
            .ok_or_else(|| Error::UnknownClient(request.client_id.clone()))?;

        if request.verify(&key) {
            Ok(())
        } else {
            Err(Error::BadSignature(request.client_id.clone()))
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::crypto::Keypair;

    #[test]
    fn test_add_client_is_idempotent() {
        let auth = ClientAuthenticator::new();
        let key = Keypair::new_pair().pubkey();
        auth.add_client("my_client_id", key).unwrap();
        auth.add_client("my_client_id", key).unwrap();
        assert_eq!(auth.len(), 1);
    }

    #[test]
    fn test_add_client_rejects_substitution() {
        let auth = ClientAuthenticator::new();
        auth.add_client("my_client_id", Keypair::new_pair().pubkey()).unwrap();
        let result = auth.add_client("my_client_id", Keypair::new_pair().pubkey());
        assert!(matches!(result, Err(Error::KeySubstitution(id)) if id == "my_client_id"));
    }

    #[test]
    fn test_verify() {
        let auth = ClientAuthenticator::new();
        let client = Keypair::new_pair();
        let request = Request::new(&client, "my_client_id", 1, json!({"life_answer": 42}));

        assert!(matches!(auth.verify(&request), Err(Error::UnknownClient(_))));

        auth.add_client("my_client_id", client.pubkey()).unwrap();
        auth.verify(&request).unwrap();

        let forged = Request::new(&Keypair::new_pair(), "my_client_id", 2, json!({}));
        assert!(matches!(auth.verify(&forged), Err(Error::BadSignature(_))));
    }

    #[test]
    fn test_clones_share_registry() {
        let auth = ClientAuthenticator::new();
        let handle = auth.clone();
        handle.add_client("c", Keypair::new_pair().pubkey()).unwrap();
        assert!(auth.contains("c"));
    }
}
