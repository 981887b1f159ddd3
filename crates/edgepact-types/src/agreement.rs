//! Agreement records and lifecycle state
//!
//! One [`Agreement`] exists per negotiation, keyed by a 256-bit hex
//! id. Records are mutated only through the agreement store by the
//! worker holding the per-agreement lock, and are frozen once
//! archived.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize, Serializer};

use crate::policy::Policy;
use crate::reason::TerminationReason;
use crate::TypesError;

/// Unique identifier of an agreement: 64 lowercase hex characters
/// covering 32 cryptographically random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreementId(pub String);

impl AgreementId {
    /// Generate a fresh random agreement id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Validate the canonical id shape.
    pub fn parse(s: impl Into<String>) -> Result<Self, TypesError> {
        let s = s.into();
        let well_formed =
            s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if well_formed {
            Ok(Self(s))
        } else {
            Err(TypesError::MalformedAgreementId { id: s })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgreementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agreement protocol version. Recorded at creation, never migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_u32(&self) -> u32 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, TypesError> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            _ => Err(TypesError::UnsupportedProtocolVersion { value }),
        }
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u32::deserialize(deserializer)?;
        ProtocolVersion::from_u32(value).map_err(serde::de::Error::custom)
    }
}

/// Where an agreement sits in its lifecycle.
///
/// `AwaitingBcReady`, `ProducerUpdateSent` and `ProducerUpdateAcked`
/// occur only for version 2 agreements, between `Replied` and
/// `Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgreementState {
    Proposed,
    Replied,
    AwaitingBcReady,
    ProducerUpdateSent,
    ProducerUpdateAcked,
    Recording,
    RecordingFailed,
    Finalized,
    DataFlowing,
    TimedOut,
    Terminated,
}

impl std::fmt::Display for AgreementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The ledger instance an agreement is bound to, once known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBinding {
    pub kind: String,
    pub name: String,
    pub org: String,
}

impl LedgerBinding {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            org: org.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.name.is_empty() && self.org.is_empty()
    }
}

/// A durable record of one negotiation between this bot and a
/// producer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agreement {
    /// 256-bit hex agreement id
    pub id: AgreementId,
    /// Protocol name this agreement negotiates under
    pub protocol: String,
    /// Protocol version, fixed at creation
    pub protocol_version: ProtocolVersion,
    /// Exchange id of the producer
    pub device_id: String,
    /// The full matched policy document
    pub policy: Policy,
    /// Canonical proposal JSON as sent to the producer
    pub proposal: String,
    /// Producer-side ledger account, v1 only, set at reply
    pub counterparty_address: String,
    /// Ledger instance, v2, set after the positive reply
    pub ledger: LedgerBinding,
    /// SHA3-256 digest of the canonical proposal, hex
    pub proposal_hash: String,
    /// Consumer signature over the proposal digest, hex
    pub consumer_proposal_sig: String,
    /// Producer signature over the proposal digest, hex
    pub producer_proposal_sig: String,
    /// Unix seconds when the producer acked the consumer update (v2)
    pub bc_update_ack_time: u64,
    /// Unix seconds when the agreement was proposed
    pub creation_time: u64,
    /// Unix seconds when the ledger recorded the agreement
    pub finalized_time: u64,
    /// Unix seconds when workload data was last seen
    pub data_received_time: u64,
    /// Consecutive missed data-verification intervals
    pub dv_missed_count: u64,
    /// Data-verification check interval, seconds
    pub dv_check_rate_sec: u64,
    /// Current lifecycle state
    pub state: AgreementState,
    /// Set when the agreement is archived
    pub termination_reason: Option<TerminationReason>,
    /// Archived agreements are frozen and retained for audit
    pub archived: bool,
}

impl Agreement {
    /// Create a freshly proposed agreement.
    pub fn new(
        id: AgreementId,
        protocol: impl Into<String>,
        device_id: impl Into<String>,
        policy: Policy,
        proposal: String,
        creation_time: u64,
    ) -> Self {
        let protocol_version = policy.agreement_protocol_version();
        let dv_check_rate_sec = policy.data_verification.check_rate_sec;
        Self {
            id,
            protocol: protocol.into(),
            protocol_version,
            device_id: device_id.into(),
            policy,
            proposal,
            counterparty_address: String::new(),
            ledger: LedgerBinding::default(),
            proposal_hash: String::new(),
            consumer_proposal_sig: String::new(),
            producer_proposal_sig: String::new(),
            bc_update_ack_time: 0,
            creation_time,
            finalized_time: 0,
            data_received_time: 0,
            dv_missed_count: 0,
            dv_check_rate_sec,
            state: AgreementState::Proposed,
            termination_reason: None,
            archived: false,
        }
    }

    /// Whether a reply has already been recorded for this agreement.
    ///
    /// v1 records the counterparty address at reply time; v2 records
    /// the ledger binding.
    pub fn already_received_reply(&self) -> bool {
        match self.protocol_version {
            ProtocolVersion::V1 => !self.counterparty_address.is_empty(),
            ProtocolVersion::V2 => !self.ledger.kind.is_empty(),
        }
    }

    /// Metering records may only be sent once both sides have signed
    /// the proposal.
    pub fn can_send_meter_record(&self) -> bool {
        !self.consumer_proposal_sig.is_empty() && !self.producer_proposal_sig.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_time > 0
    }

    /// Whether metering is enabled by the matched policy.
    pub fn metering_enabled(&self) -> bool {
        self.policy.metering.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    #[test]
    fn generated_ids_are_canonical() {
        let id = AgreementId::generate();
        assert_eq!(id.0.len(), 64);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.0, id.0.to_lowercase());
        AgreementId::parse(id.0.clone()).unwrap();
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!(AgreementId::parse("abc").is_err());
        assert!(AgreementId::parse("G".repeat(64)).is_err());
        assert!(AgreementId::parse("AB".repeat(32)).is_err());
    }

    #[test]
    fn protocol_version_serde() {
        let json = serde_json::to_string(&ProtocolVersion::V2).unwrap();
        assert_eq!(json, "2");
        let v: ProtocolVersion = serde_json::from_str("1").unwrap();
        assert_eq!(v, ProtocolVersion::V1);
        assert!(serde_json::from_str::<ProtocolVersion>("3").is_err());
    }

    #[test]
    fn reply_predicate_tracks_version() {
        let mut ag = Agreement::new(
            AgreementId::generate(),
            "edgepact-ledger",
            "node-1",
            Policy::basic("p1", ProtocolVersion::V1),
            "{}".to_string(),
            1,
        );
        assert!(!ag.already_received_reply());
        ag.counterparty_address = "0xabc".to_string();
        assert!(ag.already_received_reply());

        let mut ag2 = Agreement::new(
            AgreementId::generate(),
            "edgepact-ledger",
            "node-2",
            Policy::basic("p2", ProtocolVersion::V2),
            "{}".to_string(),
            1,
        );
        ag2.counterparty_address = "0xabc".to_string();
        assert!(!ag2.already_received_reply());
        ag2.ledger = LedgerBinding::new("eth", "bc1", "acme");
        assert!(ag2.already_received_reply());
    }

    #[test]
    fn meter_record_needs_both_signatures() {
        let mut ag = Agreement::new(
            AgreementId::generate(),
            "edgepact-ledger",
            "node-1",
            Policy::basic("p1", ProtocolVersion::V1),
            "{}".to_string(),
            1,
        );
        assert!(!ag.can_send_meter_record());
        ag.consumer_proposal_sig = "aa".to_string();
        assert!(!ag.can_send_meter_record());
        ag.producer_proposal_sig = "bb".to_string();
        assert!(ag.can_send_meter_record());
    }
}
