//! # Fault Taxonomy
//!
//! Every module has its own `thiserror` enum, but the node only ever needs
//! to ask one question of an error: *what do I do about it?* That question
//! is answered by [`FaultClass`], which every module error exposes through
//! the [`Classify`] trait.
//!
//! ```text
//!   ProtocolViolation  -> log, discard, maybe produce evidence
//!   Network            -> report to the monitor, retry after timeout
//!   Consistency        -> FATAL: stop voting, log critically
//!   ResourceExhausted  -> warn, apply back-pressure
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the runtime reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    /// A peer (or prover) sent something malformed, invalid, or conflicting.
    ProtocolViolation,
    /// A peer was unreachable or too slow.
    Network,
    /// Local state disagrees with what the network agreed. Unrecoverable
    /// without operator intervention.
    Consistency,
    /// A bounded resource is full.
    ResourceExhausted,
}

impl FaultClass {
    /// Only consistency faults halt the node.
    pub fn is_fatal(self) -> bool {
        matches!(self, FaultClass::Consistency)
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultClass::ProtocolViolation => "protocol_violation",
            FaultClass::Network => "network",
            FaultClass::Consistency => "consistency",
            FaultClass::ResourceExhausted => "resource_exhausted",
        };
        f.write_str(s)
    }
}

/// Implemented by every module error in the crate.
pub trait Classify {
    fn fault_class(&self) -> FaultClass;

    fn is_fatal(&self) -> bool {
        self.fault_class().is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_consistency_is_fatal() {
        assert!(FaultClass::Consistency.is_fatal());
        assert!(!FaultClass::ProtocolViolation.is_fatal());
        assert!(!FaultClass::Network.is_fatal());
        assert!(!FaultClass::ResourceExhausted.is_fatal());
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(FaultClass::ResourceExhausted.to_string(), "resource_exhausted");
        assert_eq!(FaultClass::ProtocolViolation.to_string(), "protocol_violation");
    }
}
