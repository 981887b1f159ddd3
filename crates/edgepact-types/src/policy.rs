//! Matched policy documents
//!
//! Policies are generated from patterns by the pattern manager and
//! consumed by the matcher. Only the parts the agreement bot core
//! acts on are modelled here; the document round-trips any other
//! fields the serializer carries.

use serde::{Deserialize, Serialize};

use crate::agreement::ProtocolVersion;
use crate::pattern::Deployment;

/// Identification header of a policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyHeader {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// An agreement protocol a policy is willing to negotiate under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementProtocol {
    pub name: String,
    pub protocol_version: ProtocolVersion,
}

/// Data-verification settings for finalized agreements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVerification {
    #[serde(default)]
    pub enabled: bool,
    /// Interval between checks, seconds
    #[serde(default = "default_check_rate")]
    pub check_rate_sec: u64,
    /// Missed intervals tolerated before termination
    #[serde(default = "default_missed_limit")]
    pub missed_limit: u64,
}

fn default_check_rate() -> u64 {
    300
}

fn default_missed_limit() -> u64 {
    3
}

impl Default for DataVerification {
    fn default() -> Self {
        Self {
            enabled: false,
            check_rate_sec: default_check_rate(),
            missed_limit: default_missed_limit(),
        }
    }
}

/// Metering terms: how often usage is attested to the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub tokens: u64,
    pub per_time_unit: String,
    #[serde(default = "default_notification_interval")]
    pub notification_interval_sec: u64,
}

fn default_notification_interval() -> u64 {
    600
}

/// A workload the policy commits the producer to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyWorkload {
    pub workload_url: String,
    pub org: String,
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
}

/// A generated policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub header: PolicyHeader,
    /// Pattern this policy was generated from, when pattern-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocol>,
    #[serde(default)]
    pub workloads: Vec<PolicyWorkload>,
    #[serde(default)]
    pub data_verification: DataVerification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering: Option<Meter>,
}

impl Policy {
    /// The protocol version the matched policy dictates.
    ///
    /// The first listed agreement protocol is authoritative; an
    /// agreement created from this policy never migrates away from
    /// it. Policies that predate versioning negotiate as v1.
    pub fn agreement_protocol_version(&self) -> ProtocolVersion {
        self.agreement_protocols
            .first()
            .map(|p| p.protocol_version)
            .unwrap_or(ProtocolVersion::V1)
    }

    /// Minimal policy used by tests and defaults.
    pub fn basic(name: impl Into<String>, version: ProtocolVersion) -> Self {
        Self {
            header: PolicyHeader {
                name: name.into(),
                version: "1.0".to_string(),
            },
            pattern_id: None,
            agreement_protocols: vec![AgreementProtocol {
                name: "edgepact-ledger".to_string(),
                protocol_version: version,
            }],
            workloads: Vec::new(),
            data_verification: DataVerification::default(),
            metering: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_comes_from_first_listed() {
        let mut pol = Policy::basic("p", ProtocolVersion::V2);
        assert_eq!(pol.agreement_protocol_version(), ProtocolVersion::V2);

        pol.agreement_protocols.clear();
        assert_eq!(pol.agreement_protocol_version(), ProtocolVersion::V1);
    }

    #[test]
    fn document_round_trips() {
        let pol = Policy {
            pattern_id: Some("acme/web".to_string()),
            metering: Some(Meter {
                tokens: 4,
                per_time_unit: "hour".to_string(),
                notification_interval_sec: 120,
            }),
            ..Policy::basic("web-policy", ProtocolVersion::V2)
        };
        let json = serde_json::to_string(&pol).unwrap();
        let back: Policy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pol);
    }
}
