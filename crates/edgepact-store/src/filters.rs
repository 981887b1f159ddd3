//! Composable query filters
//!
//! Queries take a slice of filters; a record matches when every
//! filter accepts it.

use edgepact_types::{Agreement, AgreementState, ProtocolVersion};

pub type AgreementFilter = Box<dyn Fn(&Agreement) -> bool + Send + Sync>;

/// Agreements that have not been archived.
pub fn unarchived() -> AgreementFilter {
    Box::new(|a| !a.archived)
}

/// Agreements negotiated under the named protocol.
pub fn protocol(name: &str) -> AgreementFilter {
    let name = name.to_string();
    Box::new(move |a| a.protocol == name)
}

/// Agreements in the given lifecycle state.
pub fn in_state(state: AgreementState) -> AgreementFilter {
    Box::new(move |a| a.state == state)
}

/// Version 2 agreements still waiting for the ledger to come up.
pub fn awaiting_ledger() -> AgreementFilter {
    Box::new(|a| a.protocol_version == ProtocolVersion::V2 && a.bc_update_ack_time == 0)
}

/// Agreements bound to the given ledger instance.
pub fn bound_to(kind: &str, name: &str, org: &str) -> AgreementFilter {
    let (kind, name, org) = (kind.to_string(), name.to_string(), org.to_string());
    Box::new(move |a| a.ledger.kind == kind && a.ledger.name == name && a.ledger.org == org)
}
