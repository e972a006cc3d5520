use std::fmt;

use ed25519_dalek::{ed25519, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as ShaDigest, Sha256};

use super::error::{Error, Result};

pub const DIGEST_LEN: usize = 32;

/// Fixed-size SHA-256 fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pubkey {
    pub key: [u8; 32],
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub sig: [u8; 64],
}

pub trait Hashable {
    fn hash(&self) -> Digest;
}

impl Digest {
    /// Digest reserved for null requests that fill sequence gaps.
    pub const NULL: Digest = Digest([0u8; DIGEST_LEN]);

    pub fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let result = hasher.finalize();
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&result[..]);
        Digest(digest)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Rebuilds a keypair from its 32-byte secret seed.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("expected 32 secret bytes, got {}", bytes.len())))?;
        Ok(Self::from_secret(&secret))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.dalek_signer.sign(message).to_bytes();
        Signature { sig }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.dalek_signer.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

impl Pubkey {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(dalek_pubkey) = VerifyingKey::from_bytes(&self.key) else {
            return false;
        };
        let dalek_sig = ed25519::Signature::from_bytes(&signature.sig);
        dalek_pubkey.verify_strict(message, &dalek_sig).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        Pubkey { key: *bytes }
    }
}

fn decode_fixed<const N: usize>(encoded: &str) -> std::result::Result<[u8; N], String> {
    let bytes = hex::decode(encoded).map_err(|e| e.to_string())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected {} bytes, got {}", N, bytes.len()))
}

// Keys, signatures and digests travel as hex strings on the wire.
macro_rules! hex_serde {
    ($ty:ident, $len:expr, $field:tt) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.$field))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                let bytes = decode_fixed::<$len>(&encoded).map_err(de::Error::custom)?;
                Ok($ty { $field: bytes })
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.$field[..4]))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.$field))
            }
        }
    };
}

hex_serde!(Digest, DIGEST_LEN, 0);
hex_serde!(Pubkey, 32, key);
hex_serde!(Signature, 64, sig);
