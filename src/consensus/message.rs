//! Wire messages exchanged between nodes and between nodes and clients.
//!
//! Every signed message covers a domain-tagged byte layout, so a signature
//! produced for one message kind never verifies as another.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::crypto::{Digest, Hashable, Keypair, Pubkey, Signature};

pub type NodeName = String;
pub type ClientId = String;

/// Identity of a request across the pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub client_id: ClientId,
    pub req_id: u64,
}

/// Compact JSON with sorted object keys.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

struct SigningData(Vec<u8>);

impl SigningData {
    fn new(tag: &[u8]) -> Self {
        SigningData(tag.to_vec())
    }

    fn text(mut self, text: &str) -> Self {
        self.0.extend_from_slice(&(text.len() as u64).to_be_bytes());
        self.0.extend_from_slice(text.as_bytes());
        self
    }

    fn num(mut self, num: u64) -> Self {
        self.0.extend_from_slice(&num.to_be_bytes());
        self
    }

    fn bytes(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        self.0.extend_from_slice(bytes);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// A signed client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    pub req_id: u64,
    pub payload: Value,
    pub signature: Signature,
}

impl Request {
    pub fn new(signer: &Keypair, client_id: impl Into<ClientId>, req_id: u64, payload: Value) -> Self {
        let client_id = client_id.into();
        let signature = signer.sign(&Self::signing_data(&client_id, req_id, &payload));
        Request {
            client_id,
            req_id,
            payload,
            signature,
        }
    }

    pub fn signing_data(client_id: &str, req_id: u64, payload: &Value) -> Vec<u8> {
        SigningData::new(b"REQUEST:")
            .text(client_id)
            .num(req_id)
            .bytes(&canonical_bytes(payload))
            .finish()
    }

    pub fn verify(&self, key: &Pubkey) -> bool {
        key.verify(
            &Self::signing_data(&self.client_id, self.req_id, &self.payload),
            &self.signature,
        )
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            client_id: self.client_id.clone(),
            req_id: self.req_id,
        }
    }
}

impl Hashable for Request {
    fn hash(&self) -> Digest {
        Digest::of(&[
            self.client_id.as_bytes(),
            self.req_id.to_be_bytes().as_slice(),
            canonical_bytes(&self.payload).as_slice(),
        ])
    }
}

/// A node's signed answer to an executed request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub req_id: u64,
    pub result: Value,
    pub node_name: NodeName,
    pub signature: Signature,
}

impl Reply {
    pub fn new(signer: &Keypair, node_name: impl Into<NodeName>, req_id: u64, result: Value) -> Self {
        let node_name = node_name.into();
        let signature = signer.sign(&Self::signing_data(&node_name, req_id, &result));
        Reply {
            req_id,
            result,
            node_name,
            signature,
        }
    }

    pub fn signing_data(node_name: &str, req_id: u64, result: &Value) -> Vec<u8> {
        SigningData::new(b"REPLY:")
            .text(node_name)
            .num(req_id)
            .bytes(&canonical_bytes(result))
            .finish()
    }

    pub fn verify(&self, key: &Pubkey) -> bool {
        key.verify(
            &Self::signing_data(&self.node_name, self.req_id, &self.result),
            &self.signature,
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Stage {
    Propose,
    Prepare,
    Commit,
}

impl AsRef<[u8]> for Stage {
    fn as_ref(&self) -> &[u8] {
        match self {
            Stage::Propose => &b"PROPOSE:"[..],
            Stage::Prepare => &b"PREPARE:"[..],
            Stage::Commit => &b"COMMIT:"[..],
        }
    }
}

/// Body shared by Propose, Prepare and Commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub node: NodeName,
    pub view: u64,
    pub seq: u64,
    pub digest: Digest,
    pub sig: Signature,
}

impl Vote {
    pub fn new(stage: Stage, signer: &Keypair, node: &str, view: u64, seq: u64, digest: Digest) -> Self {
        let sig = signer.sign(&Self::signing_data(stage, node, view, seq, &digest));
        Vote {
            node: node.to_string(),
            view,
            seq,
            digest,
            sig,
        }
    }

    pub fn signing_data(stage: Stage, node: &str, view: u64, seq: u64, digest: &Digest) -> Vec<u8> {
        SigningData::new(stage.as_ref())
            .text(node)
            .num(view)
            .num(seq)
            .bytes(digest.as_bytes())
            .finish()
    }

    pub fn verify(&self, stage: Stage, key: &Pubkey) -> bool {
        key.verify(
            &Self::signing_data(stage, &self.node, self.view, self.seq, &self.digest),
            &self.sig,
        )
    }

    pub fn matches(&self, other: &Vote) -> bool {
        self.view == other.view && self.seq == other.seq && self.digest == other.digest
    }
}

/// Evidence that a sequence number was prepared in some view: the primary's
/// Propose, `2f` matching Prepares from distinct backups and the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub propose: Vote,
    pub prepares: Vec<Vote>,
    /// Absent for null requests.
    pub request: Option<Request>,
}

impl PreparedProof {
    pub fn seq(&self) -> u64 {
        self.propose.seq
    }

    pub fn view(&self) -> u64 {
        self.propose.view
    }

    pub fn digest(&self) -> Digest {
        self.propose.digest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewChange {
    pub node: NodeName,
    pub new_view: u64,
    pub last_stable_seq: u64,
    pub proof: Vec<PreparedProof>,
    pub sig: Signature,
}

impl ViewChange {
    pub fn new(
        signer: &Keypair,
        node: &str,
        new_view: u64,
        last_stable_seq: u64,
        proof: Vec<PreparedProof>,
    ) -> Self {
        let sig = signer.sign(&Self::signing_data(node, new_view, last_stable_seq, &proof));
        ViewChange {
            node: node.to_string(),
            new_view,
            last_stable_seq,
            proof,
            sig,
        }
    }

    pub fn signing_data(node: &str, new_view: u64, last_stable_seq: u64, proof: &[PreparedProof]) -> Vec<u8> {
        let mut data = SigningData::new(b"VIEWCHANGE:")
            .text(node)
            .num(new_view)
            .num(last_stable_seq)
            .num(proof.len() as u64);
        for entry in proof {
            data = data
                .num(entry.view())
                .num(entry.seq())
                .bytes(entry.digest().as_bytes());
        }
        data.finish()
    }

    pub fn verify(&self, key: &Pubkey) -> bool {
        key.verify(
            &Self::signing_data(&self.node, self.new_view, self.last_stable_seq, &self.proof),
            &self.sig,
        )
    }
}

/// Long-term key announcement used during bootstrap. The signature is made
/// with the announced key itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAnnounce {
    pub node_name: NodeName,
    pub ver_key: Pubkey,
    pub sig: Signature,
}

impl KeyAnnounce {
    pub fn new(signer: &Keypair, node_name: &str, ack: bool) -> Self {
        let ver_key = signer.pubkey();
        let sig = signer.sign(&Self::signing_data(node_name, &ver_key, ack));
        KeyAnnounce {
            node_name: node_name.to_string(),
            ver_key,
            sig,
        }
    }

    pub fn signing_data(node_name: &str, ver_key: &Pubkey, ack: bool) -> Vec<u8> {
        let tag: &[u8] = if ack { &b"KEYACK:"[..] } else { &b"KEYANNOUNCE:"[..] };
        SigningData::new(tag)
            .text(node_name)
            .bytes(ver_key.as_ref())
            .finish()
    }

    pub fn verify(&self, ack: bool) -> bool {
        self.ver_key
            .verify(&Self::signing_data(&self.node_name, &self.ver_key, ack), &self.sig)
    }
}

/// Messages exchanged between pool members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    KeyAnnounce(KeyAnnounce),
    /// Acknowledges an announcement and carries the acknowledger's key.
    KeyAck(KeyAnnounce),
    Propose(Vote),
    Prepare(Vote),
    Commit(Vote),
    ViewChange(ViewChange),
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeyAnnounce(_) => "key_announce",
            PeerMessage::KeyAck(_) => "key_ack",
            PeerMessage::Propose(_) => "propose",
            PeerMessage::Prepare(_) => "prepare",
            PeerMessage::Commit(_) => "commit",
            PeerMessage::ViewChange(_) => "view_change",
        }
    }

    /// Name of the node that signed the message.
    pub fn author(&self) -> &str {
        match self {
            PeerMessage::KeyAnnounce(announce) | PeerMessage::KeyAck(announce) => &announce.node_name,
            PeerMessage::Propose(vote) | PeerMessage::Prepare(vote) | PeerMessage::Commit(vote) => &vote.node,
            PeerMessage::ViewChange(view_change) => &view_change.node,
        }
    }
}

/// Messages exchanged between clients and nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    SubmitRequest(Request),
    Reply(Reply),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SubmitRequest(_) => "submit_request",
            ClientMessage::Reply(_) => "reply",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Peer(PeerMessage),
    Client(ClientMessage),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Peer(message) => message.kind(),
            Message::Client(message) => message.kind(),
        }
    }
}
