//! Patterns: the declarative bundles the bot serves
//!
//! A pattern describes workloads and negotiation terms published on
//! the exchange. The pattern manager reconciles the served set
//! against generated policy files using a content hash of the
//! canonical JSON form.

use serde::{Deserialize, Serialize};

use crate::policy::{AgreementProtocol, DataVerification, Meter};
use crate::TypesResult;

/// An `(org, pattern)` pair this bot is configured to serve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServedPattern {
    pub org: String,
    pub pattern: String,
}

impl ServedPattern {
    pub fn new(org: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            pattern: pattern.into(),
        }
    }
}

/// On the wire a deployment arrives either as an inline object or as
/// an escaped JSON string. The two forms are collapsed at one
/// normalization boundary, [`Deployment::normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Deployment {
    Inline(serde_json::Value),
    Escaped(String),
}

impl Deployment {
    /// Collapse both wire forms into the inline object form.
    pub fn normalize(&self) -> TypesResult<serde_json::Value> {
        match self {
            Deployment::Inline(value) => Ok(value.clone()),
            Deployment::Escaped(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw)?;
                Ok(value)
            }
        }
    }
}

/// A workload referenced by a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternWorkload {
    pub workload_url: String,
    pub org: String,
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
}

/// A pattern definition as fetched from the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub workloads: Vec<PatternWorkload>,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocol>,
    #[serde(default)]
    pub data_verification: DataVerification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering: Option<Meter>,
}

/// Strip the org prefix from a qualified `org/pattern` id.
pub fn pattern_short_id(qualified: &str) -> &str {
    match qualified.split_once('/') {
        Some((_, id)) => id,
        None => qualified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::ProtocolVersion;
    use crate::TypesError;

    #[test]
    fn deployment_both_forms_normalize_alike() {
        let inline = Deployment::Inline(serde_json::json!({"services": {"web": {"image": "web:1"}}}));
        let escaped =
            Deployment::Escaped(r#"{"services":{"web":{"image":"web:1"}}}"#.to_string());
        assert_eq!(inline.normalize().unwrap(), escaped.normalize().unwrap());
    }

    #[test]
    fn malformed_escaped_deployment_is_an_error() {
        let bad = Deployment::Escaped("{not json".to_string());
        assert!(matches!(bad.normalize(), Err(TypesError::MalformedDeployment(_))));
    }

    #[test]
    fn deployment_deserializes_untagged() {
        let from_obj: Deployment = serde_json::from_str(r#"{"services":{}}"#).unwrap();
        assert!(matches!(from_obj, Deployment::Inline(_)));

        let from_str: Deployment = serde_json::from_str(r#""{\"services\":{}}""#).unwrap();
        assert!(matches!(from_str, Deployment::Escaped(_)));
    }

    #[test]
    fn short_id_strips_org() {
        assert_eq!(pattern_short_id("acme/web"), "web");
        assert_eq!(pattern_short_id("web"), "web");
    }

    #[test]
    fn pattern_round_trips() {
        let pattern = Pattern {
            label: "web".to_string(),
            workloads: vec![PatternWorkload {
                workload_url: "https://workloads/web".to_string(),
                org: "acme".to_string(),
                version: "1.2.0".to_string(),
                arch: "amd64".to_string(),
                deployment: Some(Deployment::Inline(serde_json::json!({"services": {}}))),
            }],
            agreement_protocols: vec![AgreementProtocol {
                name: "edgepact-ledger".to_string(),
                protocol_version: ProtocolVersion::V2,
            }],
            ..Pattern::default()
        };
        let json = serde_json::to_string(&pattern).unwrap();
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }
}
