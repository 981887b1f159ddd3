//! Edgepact Store - agreement persistence
//!
//! The agreement store is an opaque keyed store with filter queries
//! and atomic field updates. [`AgreementStore`] is the seam a real
//! backend plugs into; [`MemoryStore`] is the in-process
//! implementation used by tests and the default wiring.
//!
//! # Invariants
//!
//! 1. Agreement ids are unique among unarchived agreements of the
//!    same protocol
//! 2. Every update is applied atomically
//! 3. Archived agreements are frozen; updates against them fail

pub mod filters;
pub mod memory;

pub use filters::*;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use edgepact_types::{Agreement, LedgerBinding, TerminationReason};

/// Errors from the agreement store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agreement not found: {id}")]
    NotFound { id: String },

    #[error("agreement already exists: {id}")]
    AlreadyExists { id: String },

    #[error("agreement is archived and frozen: {id}")]
    Archived { id: String },

    #[error("storage backend failure: {message}")]
    Backend { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed store of [`Agreement`] records.
///
/// Workers obtain copies; the store owns the durable state. Every
/// mutation method re-reads, applies one atomic update, and returns
/// the updated record.
#[async_trait]
pub trait AgreementStore: Send + Sync {
    /// Persist a freshly proposed agreement.
    async fn create(&self, agreement: Agreement) -> StoreResult<Agreement>;

    /// Fetch one agreement by id, applying `filters` to the result.
    async fn find_by_id(
        &self,
        id: &str,
        filters: &[AgreementFilter],
    ) -> StoreResult<Option<Agreement>>;

    /// Fetch all agreements matching every filter.
    async fn find(&self, filters: &[AgreementFilter]) -> StoreResult<Vec<Agreement>>;

    /// Record a positive reply: counterparty address (v1), producer
    /// signature and ledger binding (v2).
    async fn reply_made(
        &self,
        id: &str,
        counterparty_address: &str,
        producer_sig: &str,
        ledger: LedgerBinding,
    ) -> StoreResult<Agreement>;

    /// Record the consumer-side proposal digest and signature.
    async fn consumer_signed(
        &self,
        id: &str,
        proposal_hash: &str,
        consumer_sig: &str,
    ) -> StoreResult<Agreement>;

    /// Park a v2 agreement until its ledger instance is writable.
    async fn awaiting_bc_ready(&self, id: &str) -> StoreResult<Agreement>;

    /// Record the producer's refreshed ledger address and signature
    /// (v2 producer update).
    async fn producer_updated(
        &self,
        id: &str,
        counterparty_address: &str,
        producer_sig: &str,
    ) -> StoreResult<Agreement>;

    /// Record that the consumer update was sent to the producer (v2).
    async fn producer_update_sent(&self, id: &str) -> StoreResult<Agreement>;

    /// Record the producer's ack of the consumer update (v2).
    async fn update_acked(&self, id: &str, ack_time: u64) -> StoreResult<Agreement>;

    /// Move the agreement into the recording phase.
    async fn recording(&self, id: &str) -> StoreResult<Agreement>;

    /// Record a failed ledger write awaiting the deadline sweep.
    async fn recording_failed(&self, id: &str) -> StoreResult<Agreement>;

    /// Record ledger-confirmed creation.
    async fn finalized(&self, id: &str, finalized_time: u64) -> StoreResult<Agreement>;

    /// Record that workload data was observed.
    async fn data_received(&self, id: &str, received_time: u64) -> StoreResult<Agreement>;

    /// Record a missed data-verification interval.
    async fn dv_missed(&self, id: &str, missed_count: u64) -> StoreResult<Agreement>;

    /// Archive the agreement with a termination reason. Archiving an
    /// already archived agreement is a no-op returning the frozen
    /// record.
    async fn archive(&self, id: &str, reason: TerminationReason) -> StoreResult<Agreement>;
}
