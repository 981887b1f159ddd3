//! Events carried on the command bus
//!
//! The exchange listener and the ledger client containers publish
//! [`BusEvent`]s; the command router classifies them and turns them
//! into agreement work. The bot publishes [`NewLedgerClientRequest`]s
//! when negotiation needs a ledger client that is not running yet.

use serde::{Deserialize, Serialize};

use crate::agreement::LedgerBinding;
use crate::policy::Policy;
use crate::reason::TerminationReason;

/// Inbound events delivered to the command router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    /// An end-to-end encrypted protocol message from a producer
    NewProtocolMessage {
        from: String,
        pub_key: String,
        message_id: String,
        payload: String,
    },

    /// A raw event streamed from a ledger client
    BlockchainEvent {
        ledger: LedgerBinding,
        raw: serde_json::Value,
    },

    /// A timer sweep found an agreement past a deadline
    AgreementTimeout {
        agreement_id: String,
        reason: TerminationReason,
    },

    /// A policy served by this bot changed incompatibly
    PolicyChanged { org: String, policy_name: String },

    /// A policy served by this bot was deleted
    PolicyDeleted { org: String, policy_name: String },

    /// A workload upgrade forces replacement of an agreement
    WorkloadUpgrade {
        agreement_id: String,
        device_id: String,
    },

    /// The matcher found a producer for a policy
    MakeAgreement { device_id: String, policy: Policy },

    /// A ledger client container came up
    ClientInitialized { ledger: LedgerBinding },

    /// A ledger client container is going away
    ClientStopping { ledger: LedgerBinding },

    /// A ledger client's account is funded; the ledger is writable
    AccountFunded {
        ledger: LedgerBinding,
        service_endpoint: String,
        service_port: String,
        local_dir: String,
    },
}

impl BusEvent {
    /// Short description for logging.
    pub fn summary(&self) -> String {
        match self {
            BusEvent::NewProtocolMessage { from, message_id, .. } => {
                format!("protocol message {} from {}", message_id, from)
            }
            BusEvent::BlockchainEvent { ledger, .. } => {
                format!("ledger event from {}/{}/{}", ledger.org, ledger.kind, ledger.name)
            }
            BusEvent::AgreementTimeout { agreement_id, reason } => {
                format!("timeout for {}: {}", agreement_id, reason)
            }
            BusEvent::PolicyChanged { org, policy_name } => {
                format!("policy changed: {}/{}", org, policy_name)
            }
            BusEvent::PolicyDeleted { org, policy_name } => {
                format!("policy deleted: {}/{}", org, policy_name)
            }
            BusEvent::WorkloadUpgrade { agreement_id, .. } => {
                format!("workload upgrade for {}", agreement_id)
            }
            BusEvent::MakeAgreement { device_id, policy } => {
                format!("make agreement with {} under {}", device_id, policy.header.name)
            }
            BusEvent::ClientInitialized { ledger } => {
                format!("client initialized: {}/{}/{}", ledger.org, ledger.kind, ledger.name)
            }
            BusEvent::ClientStopping { ledger } => {
                format!("client stopping: {}/{}/{}", ledger.org, ledger.kind, ledger.name)
            }
            BusEvent::AccountFunded { ledger, .. } => {
                format!("account funded: {}/{}/{}", ledger.org, ledger.kind, ledger.name)
            }
        }
    }
}

/// Request to instantiate a ledger client container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerClientRequest {
    pub ledger: LedgerBinding,
    pub exchange_url: String,
    pub bot_id: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_by_type() {
        let ev = BusEvent::AccountFunded {
            ledger: LedgerBinding::new("eth", "bc1", "acme"),
            service_endpoint: "10.0.0.4".to_string(),
            service_port: "8545".to_string(),
            local_dir: "/var/edgepact/bc1".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"AccountFunded""#));

        let back: BusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary(), ev.summary());
    }

    #[test]
    fn timeout_reason_survives_serde() {
        let ev = BusEvent::AgreementTimeout {
            agreement_id: "ab".repeat(32),
            reason: TerminationReason::NotFinalizedTimeout,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("201"));
    }
}
