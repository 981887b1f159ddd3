//! Protocol wire messages
//!
//! Every message exchanged between consumer and producer is one
//! variant of [`ProtocolMessage`], tagged by `msg_type` on the wire.
//! Messages travel inside the encrypted exchange envelope; here they
//! are already plaintext.

use serde::{Deserialize, Serialize};

use edgepact_types::{LedgerBinding, Policy};

/// One protocol message, as carried in an envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Consumer-initiated proposal
    Proposal(Proposal),
    /// Producer's decision on a proposal
    Reply(ProposalReply),
    /// Consumer's ledger address and signature (v2)
    ConsumerUpdate(LedgerUpdate),
    /// Producer's ledger address and signature (v2)
    ProducerUpdate(LedgerUpdate),
    /// Producer's ack of the consumer update (v2)
    ConsumerUpdateAck(UpdateAck),
    /// Ledger recorded the agreement
    Finalized(FinalizedNotice),
    /// Periodic usage attestation
    Metering(MeteringNotification),
}

/// The canonical proposal. Its serialized form is what gets hashed
/// and signed by both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    pub consumer_id: String,
    pub policy: Policy,
}

/// A producer's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalReply {
    pub agreement_id: String,
    pub decision: bool,
    #[serde(default)]
    pub producer_address: String,
    #[serde(default)]
    pub producer_sig: String,
    #[serde(default)]
    pub ledger: LedgerBinding,
}

/// Ledger address and proposal signature of one side (v2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub agreement_id: String,
    pub address: String,
    pub signature: String,
}

/// Ack of a consumer update (v2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub agreement_id: String,
}

/// Notification that the ledger recorded the agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedNotice {
    pub agreement_id: String,
    pub finalized_time: u64,
}

/// Usage attestation sent to the producer while metering is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringNotification {
    pub agreement_id: String,
    pub proposal_hash: String,
    pub consumer_sig: String,
    pub producer_sig: String,
    pub consumer_address: String,
    pub producer_address: String,
    pub creation_time: u64,
    pub check_rate_sec: u64,
    pub missed_count: u64,
    pub ledger_kind: String,
}

impl ProtocolMessage {
    /// The agreement this message concerns.
    pub fn agreement_id(&self) -> &str {
        match self {
            ProtocolMessage::Proposal(m) => &m.agreement_id,
            ProtocolMessage::Reply(m) => &m.agreement_id,
            ProtocolMessage::ConsumerUpdate(m) => &m.agreement_id,
            ProtocolMessage::ProducerUpdate(m) => &m.agreement_id,
            ProtocolMessage::ConsumerUpdateAck(m) => &m.agreement_id,
            ProtocolMessage::Finalized(m) => &m.agreement_id,
            ProtocolMessage::Metering(m) => &m.agreement_id,
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("protocol messages serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgepact_types::ProtocolVersion;

    #[test]
    fn messages_tag_by_msg_type() {
        let msg = ProtocolMessage::Reply(ProposalReply {
            agreement_id: "ab".repeat(32),
            decision: true,
            producer_address: "0xp".to_string(),
            producer_sig: "sig".to_string(),
            ledger: LedgerBinding::new("eth", "bc1", "acme"),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msg_type":"reply""#));

        let back: ProtocolMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn proposal_serialization_is_stable() {
        let proposal = Proposal {
            agreement_id: "cd".repeat(32),
            protocol: "edgepact-ledger".to_string(),
            version: 2,
            consumer_id: "agbot-1".to_string(),
            policy: Policy::basic("p", ProtocolVersion::V2),
        };
        let a = serde_json::to_string(&proposal).unwrap();
        let b = serde_json::to_string(&proposal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reply_defaults_tolerate_minimal_wire_form() {
        let raw = format!(
            r#"{{"msg_type":"reply","agreement_id":"{}","decision":false}}"#,
            "ef".repeat(32)
        );
        let msg: ProtocolMessage = serde_json::from_str(&raw).unwrap();
        match msg {
            ProtocolMessage::Reply(reply) => {
                assert!(!reply.decision);
                assert!(reply.ledger.is_empty());
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }
}
