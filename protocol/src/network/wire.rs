//! # Wire Format
//!
//! Every message between nodes is an [`Envelope`]: a closed [`Message`]
//! payload plus routing metadata, signed by the node that created it.
//!
//! ```text
//! frame := magic (u32 BE) | version (u16 BE) | bincode(Envelope)
//! ```
//!
//! The magic and version prefix are checked before bincode ever runs, so a
//! peer speaking a different protocol or a newer wire version gets a clean
//! [`WireError::IncompatibleVersion`] instead of a decode failure deep
//! inside the payload.
//!
//! The signature covers everything except `ttl`. Relays decrement the TTL
//! in place and forward the same signed envelope, so the origin stays
//! verifiable at every hop and the content hash used for gossip dedup is
//! identical no matter how many hops a copy has taken.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{MAX_FRAME_SIZE, PROTOCOL_MAGIC, WIRE_PROTOCOL_VERSION};
use crate::consensus::engine::Proposal;
use crate::consensus::vote::{EquivocationEvidence, Vote};
use crate::crypto::{domain_separated_hash, verify_hex, Keypair, Signature};
use crate::error::{Classify, FaultClass};
use crate::proof::Proof;
use crate::sync::{SyncRequest, SyncResponse};

const ENVELOPE_CONTEXT: &str = "pop 2026-01 envelope";
const HEADER_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown magic {0:#010x}")]
    BadMagic(u32),

    #[error("incompatible wire version: ours {ours}, theirs {theirs}")]
    IncompatibleVersion { ours: u16, theirs: u16 },

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("envelope kind {declared:?} does not match payload {actual:?}")]
    KindMismatch {
        declared: MessageKind,
        actual: MessageKind,
    },

    #[error("envelope routing fields do not match payload")]
    HeaderMismatch,

    #[error("bad envelope signature from {0}")]
    BadSignature(String),
}

impl Classify for WireError {
    fn fault_class(&self) -> FaultClass {
        match self {
            WireError::Encode(_) => FaultClass::ResourceExhausted,
            _ => FaultClass::ProtocolViolation,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Proof,
    Proposal,
    Prevote,
    Precommit,
    Ping,
    Pong,
    SyncRequest,
    SyncResponse,
    Evidence,
}

/// Gossip topics. Point-to-point kinds (ping, sync) have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Proofs,
    Consensus,
    Evidence,
}

impl MessageKind {
    pub fn topic(self) -> Option<Topic> {
        match self {
            MessageKind::Proof => Some(Topic::Proofs),
            MessageKind::Proposal | MessageKind::Prevote | MessageKind::Precommit => {
                Some(Topic::Consensus)
            }
            MessageKind::Evidence => Some(Topic::Evidence),
            MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::SyncRequest
            | MessageKind::SyncResponse => None,
        }
    }
}

/// Everything one node can say to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Proof(Proof),
    Proposal(Box<Proposal>),
    Prevote(Vote),
    Precommit(Vote),
    /// `height` is the sender's committed height.
    Ping { nonce: u64, height: u64 },
    Pong { nonce: u64, height: u64 },
    SyncRequest { request_id: u64, request: SyncRequest },
    SyncResponse { request_id: u64, response: Box<SyncResponse> },
    Evidence(EquivocationEvidence),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Proof(_) => MessageKind::Proof,
            Message::Proposal(_) => MessageKind::Proposal,
            Message::Prevote(_) => MessageKind::Prevote,
            Message::Precommit(_) => MessageKind::Precommit,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::SyncRequest { .. } => MessageKind::SyncRequest,
            Message::SyncResponse { .. } => MessageKind::SyncResponse,
            Message::Evidence(_) => MessageKind::Evidence,
        }
    }

    /// The `(height, round)` routing fields an envelope carries for this
    /// payload.
    pub fn position(&self) -> (u64, u32) {
        match self {
            Message::Proposal(p) => (p.height, p.round),
            Message::Prevote(v) | Message::Precommit(v) => (v.height, v.round),
            Message::Ping { height, .. } | Message::Pong { height, .. } => (*height, 0),
            Message::Evidence(ev) => (ev.height(), 0),
            Message::Proof(_) | Message::SyncRequest { .. } | Message::SyncResponse { .. } => {
                (0, 0)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub kind: MessageKind,
    pub height: u64,
    pub round: u32,
    /// Hex public key of the originating node.
    pub sender: String,
    /// Remaining relay hops. Not signed.
    pub ttl: u8,
    pub nonce: u64,
    pub payload: Message,
    pub signature: Signature,
}

/// The signed portion of an envelope.
#[derive(Serialize)]
struct SignedFields<'a> {
    version: u16,
    kind: MessageKind,
    height: u64,
    round: u32,
    sender: &'a str,
    nonce: u64,
    payload: &'a Message,
}

impl Envelope {
    pub fn new(keypair: &Keypair, payload: Message, ttl: u8) -> Result<Self, WireError> {
        let (height, round) = payload.position();
        let mut envelope = Self {
            version: WIRE_PROTOCOL_VERSION,
            kind: payload.kind(),
            height,
            round,
            sender: keypair.public_key_hex(),
            ttl,
            nonce: rand::random(),
            payload,
            signature: Signature::empty(),
        };
        let digest = envelope.content_hash()?;
        envelope.signature = keypair.sign(&digest);
        Ok(envelope)
    }

    /// Digest of the signed fields. Doubles as the gossip dedup key.
    pub fn content_hash(&self) -> Result<[u8; 32], WireError> {
        let fields = SignedFields {
            version: self.version,
            kind: self.kind,
            height: self.height,
            round: self.round,
            sender: &self.sender,
            nonce: self.nonce,
            payload: &self.payload,
        };
        let bytes = bincode::serialize(&fields).map_err(|e| WireError::Encode(e.to_string()))?;
        Ok(domain_separated_hash(ENVELOPE_CONTEXT, &bytes))
    }

    /// Checks version, routing fields against the payload, and the
    /// originator's signature.
    pub fn verify(&self) -> Result<(), WireError> {
        if self.version != WIRE_PROTOCOL_VERSION {
            return Err(WireError::IncompatibleVersion {
                ours: WIRE_PROTOCOL_VERSION,
                theirs: self.version,
            });
        }
        let actual = self.payload.kind();
        if self.kind != actual {
            return Err(WireError::KindMismatch {
                declared: self.kind,
                actual,
            });
        }
        if (self.height, self.round) != self.payload.position() {
            return Err(WireError::HeaderMismatch);
        }
        let digest = self.content_hash()?;
        if !verify_hex(&self.sender, &digest, &self.signature) {
            return Err(WireError::BadSignature(self.sender.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(envelope).map_err(|e| WireError::Encode(e.to_string()))?;
    let size = HEADER_LEN + body.len();
    if size > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size,
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    frame.extend_from_slice(&WIRE_PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame. Does not verify the signature; see [`Envelope::verify`].
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::Truncated(frame.len()));
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: frame.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let magic = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = u16::from_be_bytes([frame[4], frame[5]]);
    if version != WIRE_PROTOCOL_VERSION {
        return Err(WireError::IncompatibleVersion {
            ours: WIRE_PROTOCOL_VERSION,
            theirs: version,
        });
    }
    let envelope: Envelope =
        bincode::deserialize(&frame[HEADER_LEN..]).map_err(|e| WireError::Decode(e.to_string()))?;
    if envelope.version != version {
        return Err(WireError::IncompatibleVersion {
            ours: WIRE_PROTOCOL_VERSION,
            theirs: envelope.version,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::vote::VoteStep;

    fn keypair() -> Keypair {
        Keypair::from_seed(&[9u8; 32])
    }

    fn prevote() -> Message {
        Message::Prevote(Vote::new(&keypair(), 4, 1, VoteStep::Prevote, Some([3; 32])))
    }

    #[test]
    fn frame_roundtrip_preserves_envelope() {
        let env = Envelope::new(&keypair(), prevote(), 3).unwrap();
        let decoded = decode_frame(&encode_frame(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.kind, MessageKind::Prevote);
        assert_eq!((decoded.height, decoded.round), (4, 1));
        decoded.verify().unwrap();
    }

    #[test]
    fn unknown_magic_rejected() {
        let env = Envelope::new(&keypair(), prevote(), 3).unwrap();
        let mut frame = encode_frame(&env).unwrap();
        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn newer_version_is_incompatible() {
        let env = Envelope::new(&keypair(), prevote(), 3).unwrap();
        let mut frame = encode_frame(&env).unwrap();
        frame[4..6].copy_from_slice(&(WIRE_PROTOCOL_VERSION + 1).to_be_bytes());
        assert_eq!(
            decode_frame(&frame),
            Err(WireError::IncompatibleVersion {
                ours: WIRE_PROTOCOL_VERSION,
                theirs: WIRE_PROTOCOL_VERSION + 1,
            })
        );
    }

    #[test]
    fn short_frame_rejected() {
        assert_eq!(decode_frame(&[0x50, 0x4f]), Err(WireError::Truncated(2)));
    }

    #[test]
    fn ttl_is_outside_the_signature() {
        let mut env = Envelope::new(&keypair(), prevote(), 5).unwrap();
        let before = env.content_hash().unwrap();
        env.ttl -= 1;
        assert_eq!(env.content_hash().unwrap(), before);
        env.verify().unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut env = Envelope::new(&keypair(), prevote(), 5).unwrap();
        env.nonce ^= 1;
        assert!(matches!(env.verify(), Err(WireError::BadSignature(_))));
    }

    #[test]
    fn routing_fields_must_match_payload() {
        let mut env = Envelope::new(&keypair(), prevote(), 5).unwrap();
        env.height = 99;
        assert_eq!(env.verify(), Err(WireError::HeaderMismatch));
        env.height = 4;
        env.kind = MessageKind::Precommit;
        assert!(matches!(env.verify(), Err(WireError::KindMismatch { .. })));
    }

    #[test]
    fn topics_by_kind() {
        assert_eq!(MessageKind::Proof.topic(), Some(Topic::Proofs));
        assert_eq!(MessageKind::Precommit.topic(), Some(Topic::Consensus));
        assert_eq!(MessageKind::Ping.topic(), None);
    }
}
