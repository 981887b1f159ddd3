//! Agreement work items
//!
//! The command router and the sweeps produce [`AgreementWork`]; the
//! worker pool consumes it from one unbounded channel. Items whose
//! ledger is not ready yet sit in the deferred queue until readiness
//! is signaled.

use edgepact_types::{Policy, TerminationReason};

use crate::messages::{LedgerUpdate, ProposalReply, UpdateAck};

/// One unit of agreement work.
#[derive(Debug, Clone)]
pub enum AgreementWork {
    /// Initiate a proposal to a producer
    MakeProposal { device_id: String, policy: Policy },

    /// A producer answered a proposal
    ReplyReceived { reply: ProposalReply },

    /// A producer sent its ledger address and signature (v2)
    ProducerUpdate { update: LedgerUpdate },

    /// A producer acked the consumer update (v2)
    ConsumerUpdateAck { ack: UpdateAck },

    /// Send the consumer update for an agreement (v2, deferred)
    AsyncUpdate { agreement_id: String },

    /// Write an agreement to the ledger (v2, deferred)
    AsyncWrite { agreement_id: String },

    /// The ledger recorded the agreement
    BcRecorded { agreement_id: String },

    /// The ledger recorded a termination
    BcTerminated { agreement_id: String },

    /// A sweep found the agreement past a deadline
    AgreementTimeout {
        agreement_id: String,
        reason: TerminationReason,
    },

    /// A served policy changed incompatibly
    PolicyChanged { org: String, policy_name: String },

    /// A served policy was deleted
    PolicyDeleted { org: String, policy_name: String },

    /// A workload upgrade forces replacement
    WorkloadUpgrade { agreement_id: String },
}

impl AgreementWork {
    /// The agreement this item targets, when it targets exactly one.
    pub fn agreement_id(&self) -> Option<&str> {
        match self {
            AgreementWork::MakeProposal { .. } => None,
            AgreementWork::ReplyReceived { reply } => Some(&reply.agreement_id),
            AgreementWork::ProducerUpdate { update } => Some(&update.agreement_id),
            AgreementWork::ConsumerUpdateAck { ack } => Some(&ack.agreement_id),
            AgreementWork::AsyncUpdate { agreement_id }
            | AgreementWork::AsyncWrite { agreement_id }
            | AgreementWork::BcRecorded { agreement_id }
            | AgreementWork::BcTerminated { agreement_id }
            | AgreementWork::AgreementTimeout { agreement_id, .. }
            | AgreementWork::WorkloadUpgrade { agreement_id } => Some(agreement_id),
            AgreementWork::PolicyChanged { .. } | AgreementWork::PolicyDeleted { .. } => None,
        }
    }

    /// Short name for logging.
    pub fn label(&self) -> &'static str {
        match self {
            AgreementWork::MakeProposal { .. } => "make_proposal",
            AgreementWork::ReplyReceived { .. } => "reply_received",
            AgreementWork::ProducerUpdate { .. } => "producer_update",
            AgreementWork::ConsumerUpdateAck { .. } => "consumer_update_ack",
            AgreementWork::AsyncUpdate { .. } => "async_update",
            AgreementWork::AsyncWrite { .. } => "async_write",
            AgreementWork::BcRecorded { .. } => "bc_recorded",
            AgreementWork::BcTerminated { .. } => "bc_terminated",
            AgreementWork::AgreementTimeout { .. } => "agreement_timeout",
            AgreementWork::PolicyChanged { .. } => "policy_changed",
            AgreementWork::PolicyDeleted { .. } => "policy_deleted",
            AgreementWork::WorkloadUpgrade { .. } => "workload_upgrade",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_id_present_only_for_targeted_items() {
        let id = "ab".repeat(32);
        let targeted = AgreementWork::BcRecorded { agreement_id: id.clone() };
        assert_eq!(targeted.agreement_id(), Some(id.as_str()));

        let broadcast = AgreementWork::PolicyChanged {
            org: "acme".to_string(),
            policy_name: "p".to_string(),
        };
        assert_eq!(broadcast.agreement_id(), None);
    }

    #[test]
    fn labels_are_distinct() {
        let id = "ab".repeat(32);
        let labels = [
            AgreementWork::AsyncUpdate { agreement_id: id.clone() }.label(),
            AgreementWork::AsyncWrite { agreement_id: id.clone() }.label(),
            AgreementWork::BcRecorded { agreement_id: id }.label(),
        ];
        assert_eq!(labels.len(), 3);
        assert_ne!(labels[0], labels[1]);
        assert_ne!(labels[1], labels[2]);
    }
}
