//! Edgepact Types - Canonical types for the agreement bot core
//!
//! This crate holds the vocabulary shared by every other edgepact
//! crate:
//! - Agreement records and their lifecycle state
//! - Termination reason codes with a stable numeric encoding
//! - Pattern and policy documents, including the tagged deployment form
//! - Events carried on the command bus
//! - Id generation and exchange timestamp helpers

pub mod agreement;
pub mod events;
pub mod pattern;
pub mod policy;
pub mod reason;
pub mod time;

pub use agreement::*;
pub use events::*;
pub use pattern::*;
pub use policy::*;
pub use reason::*;
pub use time::*;

use thiserror::Error;

/// Errors raised while interpreting shared types
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("malformed escaped deployment: {0}")]
    MalformedDeployment(#[from] serde_json::Error),

    #[error("unsupported protocol version: {value}")]
    UnsupportedProtocolVersion { value: u32 },

    #[error("malformed agreement id: {id}")]
    MalformedAgreementId { id: String },
}

pub type TypesResult<T> = Result<T, TypesError>;
