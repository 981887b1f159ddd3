//! In-memory agreement store
//!
//! Thread-safe map keyed by agreement id. Mutations go through a
//! single guarded closure so each update is atomic with respect to
//! concurrent readers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use edgepact_types::{Agreement, AgreementState, LedgerBinding, TerminationReason};

use crate::{AgreementFilter, AgreementStore, StoreError, StoreResult};

#[derive(Clone, Default)]
pub struct MemoryStore {
    agreements: Arc<RwLock<HashMap<String, Agreement>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation under the write lock. Fails for archived
    /// records, which are frozen.
    async fn mutate<F>(&self, id: &str, apply: F) -> StoreResult<Agreement>
    where
        F: FnOnce(&mut Agreement),
    {
        let mut agreements = self.agreements.write().await;
        let agreement = agreements
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if agreement.archived {
            return Err(StoreError::Archived { id: id.to_string() });
        }
        apply(agreement);
        Ok(agreement.clone())
    }
}

#[async_trait]
impl AgreementStore for MemoryStore {
    async fn create(&self, agreement: Agreement) -> StoreResult<Agreement> {
        let mut agreements = self.agreements.write().await;
        let key = agreement.id.as_str().to_string();
        if let Some(existing) = agreements.get(&key) {
            if !existing.archived && existing.protocol == agreement.protocol {
                return Err(StoreError::AlreadyExists { id: key });
            }
        }
        agreements.insert(key, agreement.clone());
        Ok(agreement)
    }

    async fn find_by_id(
        &self,
        id: &str,
        filters: &[AgreementFilter],
    ) -> StoreResult<Option<Agreement>> {
        let agreements = self.agreements.read().await;
        Ok(agreements
            .get(id)
            .filter(|a| filters.iter().all(|f| f(a)))
            .cloned())
    }

    async fn find(&self, filters: &[AgreementFilter]) -> StoreResult<Vec<Agreement>> {
        let agreements = self.agreements.read().await;
        let mut found: Vec<Agreement> = agreements
            .values()
            .filter(|a| filters.iter().all(|f| f(a)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.creation_time.cmp(&b.creation_time));
        Ok(found)
    }

    async fn reply_made(
        &self,
        id: &str,
        counterparty_address: &str,
        producer_sig: &str,
        ledger: LedgerBinding,
    ) -> StoreResult<Agreement> {
        let counterparty_address = counterparty_address.to_string();
        let producer_sig = producer_sig.to_string();
        self.mutate(id, |a| {
            a.counterparty_address = counterparty_address;
            a.producer_proposal_sig = producer_sig;
            a.ledger = ledger;
            a.state = AgreementState::Replied;
        })
        .await
    }

    async fn consumer_signed(
        &self,
        id: &str,
        proposal_hash: &str,
        consumer_sig: &str,
    ) -> StoreResult<Agreement> {
        let proposal_hash = proposal_hash.to_string();
        let consumer_sig = consumer_sig.to_string();
        self.mutate(id, |a| {
            a.proposal_hash = proposal_hash;
            a.consumer_proposal_sig = consumer_sig;
        })
        .await
    }

    async fn awaiting_bc_ready(&self, id: &str) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.state = AgreementState::AwaitingBcReady;
        })
        .await
    }

    async fn producer_updated(
        &self,
        id: &str,
        counterparty_address: &str,
        producer_sig: &str,
    ) -> StoreResult<Agreement> {
        let counterparty_address = counterparty_address.to_string();
        let producer_sig = producer_sig.to_string();
        self.mutate(id, |a| {
            a.counterparty_address = counterparty_address;
            a.producer_proposal_sig = producer_sig;
        })
        .await
    }

    async fn producer_update_sent(&self, id: &str) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.state = AgreementState::ProducerUpdateSent;
        })
        .await
    }

    async fn update_acked(&self, id: &str, ack_time: u64) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            // Idempotent: only the first ack records the time.
            if a.bc_update_ack_time == 0 {
                a.bc_update_ack_time = ack_time;
            }
            a.state = AgreementState::ProducerUpdateAcked;
        })
        .await
    }

    async fn recording(&self, id: &str) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.state = AgreementState::Recording;
        })
        .await
    }

    async fn recording_failed(&self, id: &str) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.state = AgreementState::RecordingFailed;
        })
        .await
    }

    async fn finalized(&self, id: &str, finalized_time: u64) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.finalized_time = finalized_time;
            a.state = AgreementState::Finalized;
        })
        .await
    }

    async fn data_received(&self, id: &str, received_time: u64) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.data_received_time = received_time;
            a.dv_missed_count = 0;
            a.state = AgreementState::DataFlowing;
        })
        .await
    }

    async fn dv_missed(&self, id: &str, missed_count: u64) -> StoreResult<Agreement> {
        self.mutate(id, |a| {
            a.dv_missed_count = missed_count;
        })
        .await
    }

    async fn archive(&self, id: &str, reason: TerminationReason) -> StoreResult<Agreement> {
        let mut agreements = self.agreements.write().await;
        let agreement = agreements
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if !agreement.archived {
            agreement.termination_reason = Some(reason);
            agreement.state = AgreementState::Terminated;
            agreement.archived = true;
        }
        Ok(agreement.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters;
    use edgepact_types::{AgreementId, Policy, ProtocolVersion};

    fn agreement() -> Agreement {
        Agreement::new(
            AgreementId::generate(),
            "edgepact-ledger",
            "node-1",
            Policy::basic("p", ProtocolVersion::V2),
            "{}".to_string(),
            10,
        )
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = MemoryStore::new();
        let ag = store.create(agreement()).await.unwrap();

        let found = store
            .find_by_id(ag.id.as_str(), &[filters::unarchived()])
            .await
            .unwrap();
        assert!(found.is_some());

        let all = store.find(&[filters::protocol("edgepact-ledger")]).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_unarchived_ids_rejected() {
        let store = MemoryStore::new();
        let ag = store.create(agreement()).await.unwrap();
        let result = store.create(ag.clone()).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn archived_agreements_are_frozen() {
        let store = MemoryStore::new();
        let ag = store.create(agreement()).await.unwrap();
        store
            .archive(ag.id.as_str(), TerminationReason::NegativeReply)
            .await
            .unwrap();

        let result = store.finalized(ag.id.as_str(), 99).await;
        assert!(matches!(result, Err(StoreError::Archived { .. })));

        // Archiving again is a no-op that keeps the first reason.
        let again = store
            .archive(ag.id.as_str(), TerminationReason::UserRequested)
            .await
            .unwrap();
        assert_eq!(again.termination_reason, Some(TerminationReason::NegativeReply));
    }

    #[tokio::test]
    async fn update_ack_time_is_write_once() {
        let store = MemoryStore::new();
        let ag = store.create(agreement()).await.unwrap();

        let first = store.update_acked(ag.id.as_str(), 100).await.unwrap();
        assert_eq!(first.bc_update_ack_time, 100);

        let second = store.update_acked(ag.id.as_str(), 200).await.unwrap();
        assert_eq!(second.bc_update_ack_time, 100);
    }

    #[tokio::test]
    async fn reply_made_records_binding_and_state() {
        let store = MemoryStore::new();
        let ag = store.create(agreement()).await.unwrap();

        let updated = store
            .reply_made(
                ag.id.as_str(),
                "0xprod",
                "sig-producer",
                LedgerBinding::new("eth", "bc1", "acme"),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, AgreementState::Replied);
        assert_eq!(updated.counterparty_address, "0xprod");
        assert!(updated.already_received_reply());
    }

    #[tokio::test]
    async fn find_filters_compose() {
        let store = MemoryStore::new();
        let a = store.create(agreement()).await.unwrap();
        let b = store.create(agreement()).await.unwrap();
        store
            .archive(b.id.as_str(), TerminationReason::NoReply)
            .await
            .unwrap();

        let live = store
            .find(&[filters::unarchived(), filters::awaiting_ledger()])
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, a.id);
    }
}
