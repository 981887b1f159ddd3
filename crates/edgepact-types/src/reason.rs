//! Termination reason codes
//!
//! The closed set of numeric codes reported to the exchange when an
//! agreement is cancelled. The numeric values are wire-stable across
//! protocol versions; the decoded strings are stable API.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize, Serializer};

/// Why an agreement was terminated.
///
/// Every reason has a fixed numeric code. Codes outside the known set
/// decode to [`TerminationReason::Unknown`], and `Unknown` always
/// encodes as 999.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// Matching policy was updated incompatibly
    PolicyChanged,
    /// Ledger did not record the agreement within the deadline
    NotFinalizedTimeout,
    /// Data verification deadline exceeded
    NoDataReceived,
    /// Producer did not answer the proposal
    NoReply,
    /// Operator action
    UserRequested,
    /// Producer returned a negative decision
    NegativeReply,
    /// Cancellation observed on the ledger
    Discovered,
    /// Workload upgrade forced replacement
    ForcedUpgrade,
    /// Ledger write exhausted its retries
    LedgerWriteFailed,
    /// Producer missed its heartbeat
    NodeHeartbeat,
    /// Ledger polling showed the agreement absent
    AgreementMissing,
    /// Fallback for codes outside the known set
    Unknown,
}

impl TerminationReason {
    /// Numeric wire code for this reason.
    pub fn code(&self) -> u32 {
        match self {
            TerminationReason::PolicyChanged => 200,
            TerminationReason::NotFinalizedTimeout => 201,
            TerminationReason::NoDataReceived => 202,
            TerminationReason::NoReply => 203,
            TerminationReason::UserRequested => 204,
            TerminationReason::NegativeReply => 205,
            TerminationReason::Discovered => 206,
            TerminationReason::ForcedUpgrade => 207,
            TerminationReason::LedgerWriteFailed => 208,
            TerminationReason::NodeHeartbeat => 209,
            TerminationReason::AgreementMissing => 210,
            TerminationReason::Unknown => 999,
        }
    }

    /// Decode a numeric wire code. Unknown codes map to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            200 => TerminationReason::PolicyChanged,
            201 => TerminationReason::NotFinalizedTimeout,
            202 => TerminationReason::NoDataReceived,
            203 => TerminationReason::NoReply,
            204 => TerminationReason::UserRequested,
            205 => TerminationReason::NegativeReply,
            206 => TerminationReason::Discovered,
            207 => TerminationReason::ForcedUpgrade,
            208 => TerminationReason::LedgerWriteFailed,
            209 => TerminationReason::NodeHeartbeat,
            210 => TerminationReason::AgreementMissing,
            _ => TerminationReason::Unknown,
        }
    }

    /// Human-readable description. These strings are stable API.
    pub fn description(&self) -> &'static str {
        match self {
            TerminationReason::PolicyChanged => "the matching policy changed",
            TerminationReason::NotFinalizedTimeout => {
                "the agreement was not recorded on the ledger within the deadline"
            }
            TerminationReason::NoDataReceived => "the producer stopped sending data",
            TerminationReason::NoReply => "the producer did not answer the proposal",
            TerminationReason::UserRequested => "cancelled by operator request",
            TerminationReason::NegativeReply => "the producer rejected the proposal",
            TerminationReason::Discovered => "cancellation was observed on the ledger",
            TerminationReason::ForcedUpgrade => "a workload upgrade forced replacement",
            TerminationReason::LedgerWriteFailed => "the ledger write exhausted its retries",
            TerminationReason::NodeHeartbeat => "the producer missed its heartbeat",
            TerminationReason::AgreementMissing => "the agreement is absent from the ledger",
            TerminationReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

// On the wire a reason is its numeric code.
impl Serialize for TerminationReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for TerminationReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        Ok(TerminationReason::from_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in 200..=210 {
            let reason = TerminationReason::from_code(code);
            assert_ne!(reason, TerminationReason::Unknown);
            assert_eq!(reason.code(), code);
        }
    }

    #[test]
    fn unknown_codes_decode_to_unknown() {
        for code in [0, 42, 199, 211, 500, 998, 1000] {
            assert_eq!(TerminationReason::from_code(code), TerminationReason::Unknown);
        }
        assert_eq!(TerminationReason::Unknown.code(), 999);
        assert_eq!(TerminationReason::from_code(999), TerminationReason::Unknown);
    }

    #[test]
    fn serde_uses_numeric_codes() {
        let json = serde_json::to_string(&TerminationReason::NegativeReply).unwrap();
        assert_eq!(json, "205");

        let back: TerminationReason = serde_json::from_str("208").unwrap();
        assert_eq!(back, TerminationReason::LedgerWriteFailed);

        let fallback: TerminationReason = serde_json::from_str("7777").unwrap();
        assert_eq!(fallback, TerminationReason::Unknown);
    }

    #[test]
    fn descriptions_are_stable() {
        assert_eq!(TerminationReason::Unknown.description(), "unknown");
        assert_eq!(
            TerminationReason::NoReply.description(),
            "the producer did not answer the proposal"
        );
    }
}
