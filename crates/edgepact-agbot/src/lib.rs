//! Edgepact Agbot - the agreement bot core
//!
//! Matches workload consumers with producers and drives each
//! negotiation through its protocol state machine:
//!
//! - [`handler::ConsumerProtocolHandler`] owns the per-protocol FSM
//! - [`worker`] runs the agreement worker pool over one work channel
//! - [`router::CommandRouter`] classifies inbound bus events
//! - [`registry::LedgerClientRegistry`] tracks ledger client readiness
//! - [`pattern::PatternManager`] reconciles served patterns with
//!   generated policy files
//! - [`sweeps`] drives the periodic deadline, data-verification and
//!   ledger-presence sweeps

pub mod adapters;
pub mod capabilities;
pub mod config;
pub mod handler;
pub mod lock;
pub mod messages;
pub mod pattern;
pub mod registry;
pub mod router;
pub mod sweeps;
pub mod work;
pub mod worker;

use thiserror::Error;

/// Errors raised by the agreement bot core.
#[derive(Debug, Error)]
pub enum AgbotError {
    /// Malformed or unclassifiable input; dropped after logging
    #[error("validation failed: {0}")]
    Validation(String),

    /// Exchange side failure; the work item fails and a sweep redrives
    #[error("exchange failure: {0}")]
    Exchange(String),

    /// Ledger side failure; the work item fails and a sweep redrives
    #[error("ledger failure: {0}")]
    Ledger(String),

    /// The requested ledger client is not known or not writable
    #[error("ledger client {org}/{kind}/{name} is not ready")]
    ClientNotReady {
        org: String,
        kind: String,
        name: String,
    },

    #[error(transparent)]
    Store(#[from] edgepact_store::StoreError),

    #[error(transparent)]
    Crypto(#[from] edgepact_crypto::CryptoError),

    #[error(transparent)]
    Types(#[from] edgepact_types::TypesError),

    /// Unrecoverable condition; propagate to shutdown
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type AgbotResult<T> = Result<T, AgbotError>;
