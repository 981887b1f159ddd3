//! The protocol capability seam
//!
//! Protocol-specific behavior is concentrated behind
//! [`ProtocolCapabilities`]: classifying inbound messages before the
//! agreement's ledger binding is known, signing proposals, demuxing
//! raw ledger events and mapping termination reasons to wire codes.
//! The FSM in [`crate::handler`] is generic over this trait.

use edgepact_crypto::{sign_content, KeyPair};
use edgepact_types::TerminationReason;

use crate::messages::{LedgerUpdate, Proposal, ProposalReply, ProtocolMessage, UpdateAck};
use crate::{AgbotError, AgbotResult};

/// Name of the built-in ledger-recorded agreement protocol.
pub const LEDGER_PROTOCOL_NAME: &str = "edgepact-ledger";

/// An inbound protocol message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundProtocolMessage {
    Reply(ProposalReply),
    ProducerUpdate(LedgerUpdate),
    ConsumerUpdateAck(UpdateAck),
}

/// A raw ledger event after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub enum DemuxedLedgerEvent {
    Created { agreement_id: String },
    ProducerTermination { agreement_id: String },
    ConsumerTermination { agreement_id: String },
    /// Anything else on the ledger stream; silently ignored
    Ignored,
}

/// Protocol-specific operations the generic FSM needs.
pub trait ProtocolCapabilities: Send + Sync {
    fn protocol_name(&self) -> &str;

    /// Classify an inbound payload. This works without any ledger
    /// binding, which is why unbound (generic) use is safe.
    fn classify_message(&self, raw: &str) -> AgbotResult<InboundProtocolMessage>;

    /// Hash and sign a proposal; returns `(digest_hex, sig_hex)`.
    fn sign_proposal(&self, proposal: &Proposal) -> AgbotResult<(String, String)>;

    /// Demultiplex a raw ledger event.
    fn demux_event(&self, raw: &serde_json::Value) -> DemuxedLedgerEvent;

    /// Wire code reported for a termination reason.
    fn cancel_code(&self, reason: TerminationReason) -> u32;
}

/// The ledger-recorded agreement protocol (versions 1 and 2).
pub struct LedgerProtocol {
    keypair: KeyPair,
}

impl LedgerProtocol {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }
}

impl ProtocolCapabilities for LedgerProtocol {
    fn protocol_name(&self) -> &str {
        LEDGER_PROTOCOL_NAME
    }

    fn classify_message(&self, raw: &str) -> AgbotResult<InboundProtocolMessage> {
        let message: ProtocolMessage = serde_json::from_str(raw)
            .map_err(|e| AgbotError::Validation(format!("unparseable protocol message: {}", e)))?;
        match message {
            ProtocolMessage::Reply(reply) => Ok(InboundProtocolMessage::Reply(reply)),
            ProtocolMessage::ProducerUpdate(update) => {
                Ok(InboundProtocolMessage::ProducerUpdate(update))
            }
            ProtocolMessage::ConsumerUpdateAck(ack) => {
                Ok(InboundProtocolMessage::ConsumerUpdateAck(ack))
            }
            other => Err(AgbotError::Validation(format!(
                "unexpected inbound message kind for agreement {}",
                other.agreement_id()
            ))),
        }
    }

    fn sign_proposal(&self, proposal: &Proposal) -> AgbotResult<(String, String)> {
        Ok(sign_content(&self.keypair, proposal)?)
    }

    fn demux_event(&self, raw: &serde_json::Value) -> DemuxedLedgerEvent {
        let agreement_id = match raw.get("agreement_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return DemuxedLedgerEvent::Ignored,
        };
        match raw.get("event").and_then(|v| v.as_str()) {
            Some("agreement_created") => DemuxedLedgerEvent::Created { agreement_id },
            Some("producer_termination") => {
                DemuxedLedgerEvent::ProducerTermination { agreement_id }
            }
            Some("consumer_termination") => {
                DemuxedLedgerEvent::ConsumerTermination { agreement_id }
            }
            _ => DemuxedLedgerEvent::Ignored,
        }
    }

    fn cancel_code(&self, reason: TerminationReason) -> u32 {
        reason.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgepact_types::{Policy, ProtocolVersion};

    fn protocol() -> LedgerProtocol {
        LedgerProtocol::new(KeyPair::generate())
    }

    #[test]
    fn classifies_reply_and_updates() {
        let p = protocol();
        let reply = serde_json::json!({
            "msg_type": "reply",
            "agreement_id": "ab".repeat(32),
            "decision": true,
            "producer_address": "0xp",
            "producer_sig": "sig",
            "ledger": {"kind": "eth", "name": "bc1", "org": "acme"},
        });
        assert!(matches!(
            p.classify_message(&reply.to_string()).unwrap(),
            InboundProtocolMessage::Reply(_)
        ));

        let update = serde_json::json!({
            "msg_type": "producer_update",
            "agreement_id": "ab".repeat(32),
            "address": "0xp",
            "signature": "sig",
        });
        assert!(matches!(
            p.classify_message(&update.to_string()).unwrap(),
            InboundProtocolMessage::ProducerUpdate(_)
        ));

        let ack = serde_json::json!({
            "msg_type": "consumer_update_ack",
            "agreement_id": "ab".repeat(32),
        });
        assert!(matches!(
            p.classify_message(&ack.to_string()).unwrap(),
            InboundProtocolMessage::ConsumerUpdateAck(_)
        ));
    }

    #[test]
    fn unknown_payloads_are_validation_errors() {
        let p = protocol();
        assert!(matches!(
            p.classify_message("not json at all"),
            Err(AgbotError::Validation(_))
        ));

        // Parseable but not an inbound kind.
        let finalized = serde_json::json!({
            "msg_type": "finalized",
            "agreement_id": "ab".repeat(32),
            "finalized_time": 7,
        });
        assert!(matches!(
            p.classify_message(&finalized.to_string()),
            Err(AgbotError::Validation(_))
        ));
    }

    #[test]
    fn demux_covers_the_three_event_kinds() {
        let p = protocol();
        let id = "cd".repeat(32);

        let created = serde_json::json!({"event": "agreement_created", "agreement_id": id});
        assert_eq!(
            p.demux_event(&created),
            DemuxedLedgerEvent::Created { agreement_id: id.clone() }
        );

        let pterm = serde_json::json!({"event": "producer_termination", "agreement_id": id});
        assert!(matches!(
            p.demux_event(&pterm),
            DemuxedLedgerEvent::ProducerTermination { .. }
        ));

        let cterm = serde_json::json!({"event": "consumer_termination", "agreement_id": id});
        assert!(matches!(
            p.demux_event(&cterm),
            DemuxedLedgerEvent::ConsumerTermination { .. }
        ));

        let other = serde_json::json!({"event": "block_sealed", "agreement_id": id});
        assert_eq!(p.demux_event(&other), DemuxedLedgerEvent::Ignored);

        let malformed = serde_json::json!({"event": "agreement_created"});
        assert_eq!(p.demux_event(&malformed), DemuxedLedgerEvent::Ignored);
    }

    #[test]
    fn signing_produces_hash_and_signature() {
        let p = protocol();
        let proposal = Proposal {
            agreement_id: "ef".repeat(32),
            protocol: LEDGER_PROTOCOL_NAME.to_string(),
            version: 1,
            consumer_id: "agbot-1".to_string(),
            policy: Policy::basic("p", ProtocolVersion::V1),
        };
        let (hash, sig) = p.sign_proposal(&proposal).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(sig.len(), 128);

        // Deterministic: same proposal, same digest.
        let (hash2, _) = p.sign_proposal(&proposal).unwrap();
        assert_eq!(hash, hash2);
    }

    #[test]
    fn cancel_codes_match_the_reason_table() {
        let p = protocol();
        assert_eq!(p.cancel_code(TerminationReason::NegativeReply), 205);
        assert_eq!(p.cancel_code(TerminationReason::Unknown), 999);
    }
}
