//! # Proofs
//!
//! A proof is a financial state transition that an external prover has
//! already checked for conservation and overflow safety. Consensus does not
//! re-derive any of that. It only cares that the proof is well formed (its id
//! is the hash of its content, the submitter signed that id) and that the
//! prover's verdict was `Proved`.
//!
//! ## Lifecycle
//!
//! ```text
//!   prover --submit--> mempool --gossip--> peers' mempools
//!                         |
//!                    proposal (block body)
//!                         |
//!                  committed block --> state store history
//! ```
//!
//! A proof is referenced by exactly one committed block, or it is dropped
//! on conflict or expiry.

use crate::crypto::{domain_separated_hash, verify_hex, Keypair, Signature};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::error::{Classify, FaultClass};

const PROOF_ID_CONTEXT: &str = "pop 2026-01 proof id";

/// 32-byte content hash identifying a proof.
///
/// Serialized as raw bytes in binary formats and as a hex string in
/// human-readable ones (JSON), so the operator API stays pleasant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ProofId(pub [u8; 32]);

impl ProofId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofId({})", &self.to_hex()[..16])
    }
}

impl Serialize for ProofId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ProofId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            ProofId::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(ProofId)
        }
    }
}

/// The prover's verdict. Only `Proved` proofs may enter the mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Proved,
    Failed,
}

/// A signed change to one account's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub account: String,
    pub delta: i64,
}

/// What a proof does to state. Opaque to consensus beyond "apply it".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofPayload {
    /// Transparent balance deltas. Applied in order; a delta that drives an
    /// account negative makes the whole proof inapplicable.
    Plaintext { entries: Vec<BalanceDelta> },
    /// A confidential commitment. The commitment bytes are recorded against
    /// the account and otherwise left alone.
    Commitment { account: String, commitment: Vec<u8> },
    /// Move `amount` from the validator's account balance into bonded stake.
    Bond { validator: String, amount: u64 },
    /// Start unbonding `amount` of the validator's stake.
    Unbond { validator: String, amount: u64 },
}

impl ProofPayload {
    /// Accounts whose state this payload touches, in first-touch order.
    pub fn touched_accounts(&self) -> Vec<&str> {
        match self {
            ProofPayload::Plaintext { entries } => {
                let mut out: Vec<&str> = Vec::with_capacity(entries.len());
                for e in entries {
                    if !out.contains(&e.account.as_str()) {
                        out.push(e.account.as_str());
                    }
                }
                out
            }
            ProofPayload::Commitment { account, .. } => vec![account.as_str()],
            ProofPayload::Bond { validator, .. } | ProofPayload::Unbond { validator, .. } => {
                vec![validator.as_str()]
            }
        }
    }
}

/// A prover-verified state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub id: ProofId,
    pub payload: ProofPayload,
    pub verdict: Verdict,
    /// Hex Ed25519 public key of the submitter.
    pub submitter: String,
    /// Signature by `submitter` over `id`.
    pub signature: Signature,
    /// Unix milliseconds at creation.
    pub timestamp: u64,
    /// Proofs that must be applied before this one.
    pub dependencies: Vec<ProofId>,
}

/// Errors from structural proof validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("proof id {claimed} does not match content hash {computed}")]
    IdMismatch { claimed: ProofId, computed: ProofId },

    #[error("invalid submitter signature on proof {0}")]
    BadSignature(ProofId),

    #[error("proof {0} has an empty payload")]
    EmptyPayload(ProofId),

    #[error("proof {0} depends on itself")]
    SelfDependency(ProofId),
}

impl Classify for ProofError {
    fn fault_class(&self) -> FaultClass {
        FaultClass::ProtocolViolation
    }
}

#[derive(Serialize)]
struct IdContent<'a> {
    payload: &'a ProofPayload,
    verdict: Verdict,
    submitter: &'a str,
    timestamp: u64,
    dependencies: &'a [ProofId],
}

impl Proof {
    /// Build and sign a proof. This is what a prover does.
    pub fn new(
        keypair: &Keypair,
        payload: ProofPayload,
        verdict: Verdict,
        timestamp: u64,
        dependencies: Vec<ProofId>,
    ) -> Self {
        let submitter = keypair.public_key_hex();
        let id = Self::compute_id(&payload, verdict, &submitter, timestamp, &dependencies);
        let signature = keypair.sign(id.as_bytes());
        Self {
            id,
            payload,
            verdict,
            submitter,
            signature,
            timestamp,
            dependencies,
        }
    }

    /// The content hash over everything except the id and signature.
    pub fn compute_id(
        payload: &ProofPayload,
        verdict: Verdict,
        submitter: &str,
        timestamp: u64,
        dependencies: &[ProofId],
    ) -> ProofId {
        let content = IdContent {
            payload,
            verdict,
            submitter,
            timestamp,
            dependencies,
        };
        let bytes = bincode::serialize(&content).unwrap_or_default();
        ProofId(domain_separated_hash(PROOF_ID_CONTEXT, &bytes))
    }

    /// Structural validation: id matches content, signature verifies,
    /// payload is non-empty, no self-dependency.
    ///
    /// Does not look at the verdict; the mempool rejects `Failed` proofs
    /// with a more specific error.
    pub fn validate(&self) -> Result<(), ProofError> {
        let computed = Self::compute_id(
            &self.payload,
            self.verdict,
            &self.submitter,
            self.timestamp,
            &self.dependencies,
        );
        if computed != self.id {
            return Err(ProofError::IdMismatch {
                claimed: self.id,
                computed,
            });
        }
        if !verify_hex(&self.submitter, self.id.as_bytes(), &self.signature) {
            return Err(ProofError::BadSignature(self.id));
        }
        let empty = match &self.payload {
            ProofPayload::Plaintext { entries } => entries.is_empty(),
            ProofPayload::Commitment { commitment, .. } => commitment.is_empty(),
            ProofPayload::Bond { amount, .. } | ProofPayload::Unbond { amount, .. } => *amount == 0,
        };
        if empty {
            return Err(ProofError::EmptyPayload(self.id));
        }
        if self.dependencies.contains(&self.id) {
            return Err(ProofError::SelfDependency(self.id));
        }
        Ok(())
    }

    pub fn is_proved(&self) -> bool {
        self.verdict == Verdict::Proved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(kp: &Keypair, ts: u64) -> Proof {
        Proof::new(
            kp,
            ProofPayload::Plaintext {
                entries: vec![
                    BalanceDelta {
                        account: "alice".into(),
                        delta: -10,
                    },
                    BalanceDelta {
                        account: "bob".into(),
                        delta: 10,
                    },
                ],
            },
            Verdict::Proved,
            ts,
            vec![],
        )
    }

    #[test]
    fn new_proof_validates() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let proof = transfer(&kp, 1_000);
        assert!(proof.validate().is_ok());
        assert!(proof.is_proved());
    }

    #[test]
    fn id_covers_timestamp() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        assert_ne!(transfer(&kp, 1).id, transfer(&kp, 2).id);
    }

    #[test]
    fn tampered_payload_fails_id_check() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let mut proof = transfer(&kp, 1_000);
        proof.payload = ProofPayload::Plaintext {
            entries: vec![BalanceDelta {
                account: "mallory".into(),
                delta: 1_000_000,
            }],
        };
        assert!(matches!(proof.validate(), Err(ProofError::IdMismatch { .. })));
    }

    #[test]
    fn foreign_signature_rejected() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let other = Keypair::from_seed(&[2u8; 32]);
        let mut proof = transfer(&kp, 1_000);
        proof.signature = other.sign(proof.id.as_bytes());
        assert_eq!(proof.validate(), Err(ProofError::BadSignature(proof.id)));
    }

    #[test]
    fn empty_payload_rejected() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let proof = Proof::new(
            &kp,
            ProofPayload::Plaintext { entries: vec![] },
            Verdict::Proved,
            5,
            vec![],
        );
        assert!(matches!(proof.validate(), Err(ProofError::EmptyPayload(_))));
    }

    #[test]
    fn proof_id_json_is_hex() {
        let id = ProofId([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: ProofId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn proof_id_binary_is_raw_bytes() {
        let id = ProofId([7u8; 32]);
        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn touched_accounts_are_unique_in_order() {
        let payload = ProofPayload::Plaintext {
            entries: vec![
                BalanceDelta {
                    account: "b".into(),
                    delta: 1,
                },
                BalanceDelta {
                    account: "a".into(),
                    delta: -1,
                },
                BalanceDelta {
                    account: "b".into(),
                    delta: 2,
                },
            ],
        };
        assert_eq!(payload.touched_accounts(), vec!["b", "a"]);
    }
}
