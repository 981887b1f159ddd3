//! The consumer protocol handler
//!
//! Drives every agreement of one protocol through its state machine:
//!
//! ```text
//! Proposed -> Replied -> {RecordingFailed, Recording} -> Finalized
//!          -> {DataFlowing -> Terminated | TimedOut -> Terminated}
//! ```
//!
//! Version 2 inserts `Replied -> AwaitingBcReady -> ProducerUpdateSent
//! -> ProducerUpdateAcked -> Recording`.
//!
//! Work arrives on one unbounded channel and is processed by the
//! worker pool under per-agreement locks. The lock covers each
//! read-decide-persist step; it is never held across an outbound
//! send, and failed sends are redriven from persisted state by the
//! timer sweeps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use edgepact_store::{filters, AgreementFilter, AgreementStore};
use edgepact_types::{
    unix_now, Agreement, AgreementId, AgreementState, BusEvent, LedgerBinding,
    NewLedgerClientRequest, Policy, ProtocolVersion, TerminationReason,
};

use crate::adapters::{ExchangeMessaging, LedgerClientFactory, LedgerRecord};
use crate::capabilities::{DemuxedLedgerEvent, InboundProtocolMessage, ProtocolCapabilities};
use crate::config::AgbotConfig;
use crate::lock::AgreementLockManager;
use crate::messages::{
    FinalizedNotice, LedgerUpdate, MeteringNotification, Proposal, ProposalReply, ProtocolMessage,
    UpdateAck,
};
use crate::registry::LedgerClientRegistry;
use crate::work::AgreementWork;
use crate::{AgbotError, AgbotResult};

pub struct ConsumerProtocolHandler {
    config: AgbotConfig,
    capabilities: Arc<dyn ProtocolCapabilities>,
    store: Arc<dyn AgreementStore>,
    exchange: Arc<dyn ExchangeMessaging>,
    registry: LedgerClientRegistry,
    locks: AgreementLockManager,
    work_tx: mpsc::UnboundedSender<AgreementWork>,
    work_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<AgreementWork>>>,
    deferred: parking_lot::Mutex<VecDeque<AgreementWork>>,
    control_tx: mpsc::UnboundedSender<NewLedgerClientRequest>,
}

impl ConsumerProtocolHandler {
    pub fn new(
        config: AgbotConfig,
        capabilities: Arc<dyn ProtocolCapabilities>,
        store: Arc<dyn AgreementStore>,
        exchange: Arc<dyn ExchangeMessaging>,
        factory: Arc<dyn LedgerClientFactory>,
        control_tx: mpsc::UnboundedSender<NewLedgerClientRequest>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            capabilities,
            store,
            exchange,
            registry: LedgerClientRegistry::new(factory),
            locks: AgreementLockManager::new(),
            work_tx,
            work_rx: parking_lot::Mutex::new(Some(work_rx)),
            deferred: parking_lot::Mutex::new(VecDeque::new()),
            control_tx,
        })
    }

    pub fn protocol_name(&self) -> &str {
        self.capabilities.protocol_name()
    }

    pub fn registry(&self) -> &LedgerClientRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn AgreementStore> {
        &self.store
    }

    pub fn config(&self) -> &AgbotConfig {
        &self.config
    }

    /// The single consumer end of the work channel; taken once by the
    /// worker pool.
    pub fn take_work_receiver(&self) -> Option<mpsc::UnboundedReceiver<AgreementWork>> {
        self.work_rx.lock().take()
    }

    /// Router-side gate: which bus events this handler accepts.
    /// Ledger events for instances that are not ready are dropped
    /// here, before any work is queued.
    pub fn accept_command(&self, event: &BusEvent) -> bool {
        match event {
            BusEvent::BlockchainEvent { ledger, .. } => self.registry.is_ready(ledger),
            BusEvent::NewProtocolMessage { .. }
            | BusEvent::AgreementTimeout { .. }
            | BusEvent::PolicyChanged { .. }
            | BusEvent::PolicyDeleted { .. }
            | BusEvent::WorkloadUpgrade { .. }
            | BusEvent::MakeAgreement { .. } => true,
            // Client lifecycle events update the registry directly.
            BusEvent::ClientInitialized { .. }
            | BusEvent::ClientStopping { .. }
            | BusEvent::AccountFunded { .. } => false,
        }
    }

    pub fn enqueue(&self, work: AgreementWork) {
        tracing::debug!(kind = work.label(), "queued agreement work");
        // Receiver lives as long as the handler; a send only fails
        // during shutdown, when dropping work is correct.
        let _ = self.work_tx.send(work);
    }

    /// Park work until the ledger it needs reports writable.
    pub fn defer(&self, work: AgreementWork) {
        tracing::debug!(kind = work.label(), "deferred agreement work");
        self.deferred.lock().push_back(work);
    }

    /// Move the whole deferred batch back to the work channel in
    /// insertion order.
    pub fn drain_deferred(&self) {
        let batch: Vec<AgreementWork> = self.deferred.lock().drain(..).collect();
        for work in batch {
            self.enqueue(work);
        }
    }

    // ------------------------------------------------------------------
    // Inbound classification

    /// Classify an inbound protocol message and queue the matching
    /// work. Classification needs no ledger binding, so this runs
    /// against the unbound capability set (the generic handler).
    pub fn handle_protocol_message(&self, payload: &str) -> AgbotResult<()> {
        match self.capabilities.classify_message(payload)? {
            InboundProtocolMessage::Reply(reply) => {
                self.enqueue(AgreementWork::ReplyReceived { reply })
            }
            InboundProtocolMessage::ProducerUpdate(update) => {
                self.enqueue(AgreementWork::ProducerUpdate { update })
            }
            InboundProtocolMessage::ConsumerUpdateAck(ack) => {
                self.enqueue(AgreementWork::ConsumerUpdateAck { ack })
            }
        }
        Ok(())
    }

    /// Demultiplex a raw ledger event. Creation and termination
    /// events queue work, anything else is ignored. Unknown agreement
    /// ids are accepted; the worker no-ops on a missing agreement.
    pub fn handle_ledger_event(&self, raw: &serde_json::Value) {
        match self.capabilities.demux_event(raw) {
            DemuxedLedgerEvent::Created { agreement_id } => {
                self.enqueue(AgreementWork::BcRecorded { agreement_id });
            }
            DemuxedLedgerEvent::ProducerTermination { agreement_id }
            | DemuxedLedgerEvent::ConsumerTermination { agreement_id } => {
                self.enqueue(AgreementWork::BcTerminated { agreement_id });
            }
            DemuxedLedgerEvent::Ignored => {
                tracing::debug!("ignoring ledger event: not creation or termination");
            }
        }
    }

    // ------------------------------------------------------------------
    // Ledger client lifecycle

    pub fn client_not_available(&self, ledger: &LedgerBinding) {
        self.registry.set_not_available(ledger);
    }

    /// A ledger client's account was funded: the instance is writable
    /// now. Upgrades the registry, re-queues every v2 agreement still
    /// waiting on a ledger, and releases the deferred batch.
    pub async fn client_writable(
        &self,
        ledger: &LedgerBinding,
        service_endpoint: &str,
        service_port: &str,
        local_dir: &str,
    ) -> AgbotResult<()> {
        self.registry
            .set_writable(ledger, service_endpoint, service_port, local_dir)?;
        self.update_producers().await;
        self.drain_deferred();
        Ok(())
    }

    /// Queue `(AsyncUpdate, AsyncWrite)` for every v2 agreement that
    /// has not completed the update handshake. Idempotent: a worker
    /// re-reads state under the agreement lock and drops duplicates.
    async fn update_producers(&self) {
        let waiting = match self
            .store
            .find(&[
                filters::unarchived(),
                filters::protocol(self.protocol_name()),
                filters::awaiting_ledger(),
            ])
            .await
        {
            Ok(waiting) => waiting,
            Err(e) => {
                tracing::error!(error = %e, "failed to query agreements awaiting the ledger");
                return;
            }
        };
        for ag in waiting {
            self.defer(AgreementWork::AsyncUpdate {
                agreement_id: ag.id.to_string(),
            });
            self.defer(AgreementWork::AsyncWrite {
                agreement_id: ag.id.to_string(),
            });
        }
    }

    pub(crate) fn request_new_client(&self, ledger: &LedgerBinding) {
        let request = NewLedgerClientRequest {
            ledger: ledger.clone(),
            exchange_url: self.config.exchange_url.clone(),
            bot_id: self.config.bot_id.clone(),
            token: self.config.token.clone(),
        };
        tracing::info!(
            org = %ledger.org,
            kind = %ledger.kind,
            name = %ledger.name,
            "requesting ledger client instantiation"
        );
        let _ = self.control_tx.send(request);
    }

    // ------------------------------------------------------------------
    // Work dispatch

    /// Process one work item. Called by a pool worker; targeted items
    /// serialize on the per-agreement lock inside each step.
    pub async fn process(&self, work: AgreementWork) -> AgbotResult<()> {
        match work {
            AgreementWork::MakeProposal { device_id, policy } => {
                self.make_proposal(&device_id, policy).await
            }
            AgreementWork::ReplyReceived { reply } => self.reply_received(reply).await,
            AgreementWork::ProducerUpdate { update } => self.producer_update(update).await,
            AgreementWork::ConsumerUpdateAck { ack } => self.consumer_update_ack(ack).await,
            AgreementWork::AsyncUpdate { agreement_id } => self.async_update(&agreement_id).await,
            AgreementWork::AsyncWrite { agreement_id } => self.async_write(&agreement_id).await,
            AgreementWork::BcRecorded { agreement_id } => self.bc_recorded(&agreement_id).await,
            AgreementWork::BcTerminated { agreement_id } => self.bc_terminated(&agreement_id).await,
            AgreementWork::AgreementTimeout { agreement_id, reason } => {
                self.timeout(&agreement_id, reason).await
            }
            AgreementWork::PolicyChanged { org, policy_name } => {
                self.policy_gone(&org, &policy_name).await
            }
            AgreementWork::PolicyDeleted { org, policy_name } => {
                self.policy_gone(&org, &policy_name).await
            }
            AgreementWork::WorkloadUpgrade { agreement_id } => {
                self.workload_upgrade(&agreement_id).await
            }
        }
    }

    /// Initiate an agreement: pick an id, persist `Proposed`, sign
    /// the canonical proposal and send it to the producer.
    async fn make_proposal(&self, device_id: &str, policy: Policy) -> AgbotResult<()> {
        let id = AgreementId::generate();
        let version = policy.agreement_protocol_version();
        let proposal = Proposal {
            agreement_id: id.to_string(),
            protocol: self.protocol_name().to_string(),
            version: version.as_u32(),
            consumer_id: self.config.bot_id.clone(),
            policy: policy.clone(),
        };
        let proposal_json = serde_json::to_string(&proposal)
            .map_err(|e| AgbotError::Validation(format!("unserializable proposal: {}", e)))?;

        let lock = self.locks.for_agreement(id.as_str());
        {
            let _guard = lock.lock().await;
            let agreement = Agreement::new(
                id.clone(),
                self.protocol_name(),
                device_id,
                policy,
                proposal_json,
                unix_now(),
            );
            self.store.create(agreement).await?;
            let (hash, sig) = self.capabilities.sign_proposal(&proposal)?;
            self.store.consumer_signed(id.as_str(), &hash, &sig).await?;
        }

        tracing::info!(agreement = %id, device = device_id, version = version.as_u32(), "proposing agreement");
        let sent = match self.exchange.device_endpoint(device_id).await {
            Ok(target) => {
                self.exchange
                    .send(&target, &ProtocolMessage::Proposal(proposal).to_payload())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(agreement = %id, error = %e, "proposal send failed, archiving");
            let _guard = lock.lock().await;
            self.store
                .archive(id.as_str(), TerminationReason::NoReply)
                .await?;
            self.locks.remove(id.as_str());
        }
        Ok(())
    }

    /// Handle a producer's reply. Negative decisions archive the
    /// agreement; positive ones record the reply and move the
    /// agreement toward the ledger write.
    async fn reply_received(&self, reply: ProposalReply) -> AgbotResult<()> {
        let id = reply.agreement_id.clone();
        let lock = self.locks.for_agreement(&id);

        let recorded = {
            let _guard = lock.lock().await;
            let Some(agreement) = self.find_live(&id).await? else {
                tracing::debug!(agreement = %id, "reply for unknown or archived agreement, dropping");
                return Ok(());
            };
            if agreement.already_received_reply() {
                tracing::debug!(agreement = %id, "duplicate reply, dropping");
                return Ok(());
            }
            if !reply.decision {
                tracing::info!(agreement = %id, "producer declined the proposal");
                drop(_guard);
                return self.terminate_by_id(&id, TerminationReason::NegativeReply).await;
            }
            self.store
                .reply_made(&id, &reply.producer_address, &reply.producer_sig, reply.ledger.clone())
                .await?
        };

        match recorded.protocol_version {
            ProtocolVersion::V1 => self.record_v1(recorded, &reply).await,
            ProtocolVersion::V2 => {
                if self.registry.is_writable(&recorded.ledger) {
                    {
                        let _guard = lock.lock().await;
                        self.store.awaiting_bc_ready(&id).await?;
                    }
                    self.defer(AgreementWork::AsyncUpdate { agreement_id: id.clone() });
                    self.defer(AgreementWork::AsyncWrite { agreement_id: id });
                    self.drain_deferred();
                } else {
                    // Stays in Replied until a readiness event lands.
                    self.request_new_client(&recorded.ledger);
                }
                Ok(())
            }
        }
    }

    /// v1: record the reply directly against the ledger bound to the
    /// reply's instance.
    async fn record_v1(&self, agreement: Agreement, reply: &ProposalReply) -> AgbotResult<()> {
        let id = agreement.id.to_string();
        let Some(client) = self.registry.client(&agreement.ledger) else {
            tracing::warn!(agreement = %id, "ledger client not ready for v1 recording");
            return Err(AgbotError::ClientNotReady {
                org: agreement.ledger.org.clone(),
                kind: agreement.ledger.kind.clone(),
                name: agreement.ledger.name.clone(),
            });
        };

        let lock = self.locks.for_agreement(&id);
        {
            let _guard = lock.lock().await;
            self.store.recording(&id).await?;
        }

        let write = async {
            let consumer_address = client.account().await?;
            let record = LedgerRecord {
                agreement_id: id.clone(),
                proposal_hash: agreement.proposal_hash.clone(),
                consumer_sig: agreement.consumer_proposal_sig.clone(),
                producer_sig: reply.producer_sig.clone(),
                consumer_address,
                producer_address: reply.producer_address.clone(),
            };
            client.write_agreement(&record).await
        };
        if let Err(e) = write.await {
            tracing::warn!(agreement = %id, error = %e, "ledger write failed, awaiting deadline sweep");
            let _guard = lock.lock().await;
            self.store.recording_failed(&id).await?;
        } else {
            tracing::info!(agreement = %id, "recorded agreement reply on the ledger");
        }
        Ok(())
    }

    /// v2: the producer sent its refreshed ledger address and
    /// signature.
    async fn producer_update(&self, update: LedgerUpdate) -> AgbotResult<()> {
        let id = update.agreement_id.clone();
        let lock = self.locks.for_agreement(&id);
        let _guard = lock.lock().await;
        if self.find_live(&id).await?.is_none() {
            tracing::debug!(agreement = %id, "producer update for unknown agreement, dropping");
            return Ok(());
        }
        self.store
            .producer_updated(&id, &update.address, &update.signature)
            .await?;
        Ok(())
    }

    /// v2: the producer acked our consumer update. Only after this may
    /// the ledger write proceed.
    async fn consumer_update_ack(&self, ack: UpdateAck) -> AgbotResult<()> {
        let id = ack.agreement_id.clone();
        let lock = self.locks.for_agreement(&id);
        let _guard = lock.lock().await;
        let Some(agreement) = self.find_live(&id).await? else {
            tracing::debug!(agreement = %id, "update ack for unknown agreement, dropping");
            return Ok(());
        };
        if agreement.bc_update_ack_time > 0 {
            tracing::debug!(agreement = %id, "duplicate update ack, dropping");
            return Ok(());
        }
        self.store.update_acked(&id, unix_now()).await?;
        Ok(())
    }

    /// v2 deferred step: send the consumer-side signature and ledger
    /// address to the producer.
    async fn async_update(&self, id: &str) -> AgbotResult<()> {
        let lock = self.locks.for_agreement(id);
        let agreement = {
            let _guard = lock.lock().await;
            let Some(agreement) = self.find_live(id).await? else {
                return Ok(());
            };
            // A readiness sweep may queue duplicates for agreements
            // that progressed in the meantime.
            if agreement.bc_update_ack_time > 0
                || matches!(
                    agreement.state,
                    AgreementState::Recording
                        | AgreementState::RecordingFailed
                        | AgreementState::Finalized
                        | AgreementState::DataFlowing
                )
            {
                tracing::debug!(agreement = %id, "update already progressed, dropping");
                return Ok(());
            }
            if !self.registry.is_writable(&agreement.ledger) {
                self.defer(AgreementWork::AsyncUpdate { agreement_id: id.to_string() });
                return Ok(());
            }
            agreement
        };

        let Some(client) = self.registry.client(&agreement.ledger) else {
            self.defer(AgreementWork::AsyncUpdate { agreement_id: id.to_string() });
            return Ok(());
        };
        let proposal: Proposal = serde_json::from_str(&agreement.proposal)
            .map_err(|e| AgbotError::Validation(format!("stored proposal unparseable: {}", e)))?;
        let (hash, sig) = self.capabilities.sign_proposal(&proposal)?;
        let consumer_address = client.account().await?;

        let update = ProtocolMessage::ConsumerUpdate(LedgerUpdate {
            agreement_id: id.to_string(),
            address: consumer_address,
            signature: sig.clone(),
        });
        let target = self.exchange.device_endpoint(&agreement.device_id).await?;
        self.exchange.send(&target, &update.to_payload()).await?;

        let _guard = lock.lock().await;
        self.store.consumer_signed(id, &hash, &sig).await?;
        self.store.producer_update_sent(id).await?;
        Ok(())
    }

    /// v2 deferred step: record the agreement on the ledger. Gated on
    /// the producer's ack of the consumer update.
    async fn async_write(&self, id: &str) -> AgbotResult<()> {
        let lock = self.locks.for_agreement(id);
        let agreement = {
            let _guard = lock.lock().await;
            let Some(agreement) = self.find_live(id).await? else {
                return Ok(());
            };
            if matches!(
                agreement.state,
                AgreementState::Recording
                    | AgreementState::RecordingFailed
                    | AgreementState::Finalized
                    | AgreementState::DataFlowing
            ) {
                tracing::debug!(agreement = %id, "write already progressed, dropping");
                return Ok(());
            }
            if agreement.bc_update_ack_time == 0 || !self.registry.is_writable(&agreement.ledger) {
                self.defer(AgreementWork::AsyncWrite { agreement_id: id.to_string() });
                return Ok(());
            }
            agreement
        };

        let Some(client) = self.registry.client(&agreement.ledger) else {
            self.defer(AgreementWork::AsyncWrite { agreement_id: id.to_string() });
            return Ok(());
        };
        let write = async {
            let consumer_address = client.account().await?;
            let record = LedgerRecord {
                agreement_id: id.to_string(),
                proposal_hash: agreement.proposal_hash.clone(),
                consumer_sig: agreement.consumer_proposal_sig.clone(),
                producer_sig: agreement.producer_proposal_sig.clone(),
                consumer_address,
                producer_address: agreement.counterparty_address.clone(),
            };
            client.write_agreement(&record).await
        };

        let outcome = write.await;
        let _guard = lock.lock().await;
        if let Err(e) = outcome {
            tracing::warn!(agreement = %id, error = %e, "ledger write failed, awaiting deadline sweep");
            self.store.recording_failed(id).await?;
        } else {
            self.store.recording(id).await?;
            tracing::info!(agreement = %id, "agreement written to the ledger");
        }
        Ok(())
    }

    /// The ledger recorded the agreement. Replays and events for
    /// archived or unknown agreements are no-ops.
    async fn bc_recorded(&self, id: &str) -> AgbotResult<()> {
        let lock = self.locks.for_agreement(id);
        let finalized = {
            let _guard = lock.lock().await;
            let Some(agreement) = self.store.find_by_id(id, &[]).await? else {
                tracing::debug!(agreement = %id, "ledger creation event for unknown agreement, dropping");
                return Ok(());
            };
            if agreement.archived {
                tracing::debug!(agreement = %id, "late ledger creation event after archive, dropping");
                return Ok(());
            }
            if agreement.is_finalized() {
                tracing::debug!(agreement = %id, "replayed ledger creation event, dropping");
                return Ok(());
            }
            self.store.finalized(id, unix_now()).await?
        };

        tracing::info!(agreement = %id, "agreement finalized");
        let notice = ProtocolMessage::Finalized(FinalizedNotice {
            agreement_id: id.to_string(),
            finalized_time: finalized.finalized_time,
        });
        let notify = async {
            let target = self.exchange.device_endpoint(&finalized.device_id).await?;
            self.exchange.send(&target, &notice.to_payload()).await
        };
        if let Err(e) = notify.await {
            tracing::warn!(agreement = %id, error = %e, "finalized notification failed");
        }
        Ok(())
    }

    /// The ledger recorded a termination by either side.
    async fn bc_terminated(&self, id: &str) -> AgbotResult<()> {
        if self.find_live(id).await?.is_none() {
            tracing::debug!(agreement = %id, "ledger termination for unknown agreement, dropping");
            return Ok(());
        }
        self.terminate_by_id(id, TerminationReason::Discovered).await
    }

    /// A sweep flagged the agreement past a deadline.
    async fn timeout(&self, id: &str, reason: TerminationReason) -> AgbotResult<()> {
        let Some(agreement) = self.find_live(id).await? else {
            return Ok(());
        };
        // The ledger may have caught up between the sweep and now.
        if reason == TerminationReason::NotFinalizedTimeout && agreement.is_finalized() {
            tracing::debug!(agreement = %id, "finalized before timeout processing, dropping");
            return Ok(());
        }
        self.terminate_by_id(id, reason).await
    }

    /// Terminate every live agreement matched under a changed or
    /// deleted policy, one work item per agreement.
    async fn policy_gone(&self, org: &str, policy_name: &str) -> AgbotResult<()> {
        let live = self
            .store
            .find(&[filters::unarchived(), filters::protocol(self.protocol_name())])
            .await?;
        for agreement in live {
            if agreement.policy.header.name == policy_name {
                tracing::info!(agreement = %agreement.id, org, policy = policy_name, "policy gone, terminating");
                self.enqueue(AgreementWork::AgreementTimeout {
                    agreement_id: agreement.id.to_string(),
                    reason: TerminationReason::PolicyChanged,
                });
            }
        }
        Ok(())
    }

    async fn workload_upgrade(&self, id: &str) -> AgbotResult<()> {
        if self.find_live(id).await?.is_none() {
            return Ok(());
        }
        self.terminate_by_id(id, TerminationReason::ForcedUpgrade).await
    }

    // ------------------------------------------------------------------
    // Termination

    /// Whether the termination path can reach the ledger right now.
    /// Unbound agreements have nothing recorded, so they can always
    /// cancel.
    pub fn can_cancel_now(&self, agreement: &Agreement) -> bool {
        if agreement.ledger.is_empty() {
            return true;
        }
        self.registry.is_ready(&agreement.ledger)
    }

    /// Terminate an agreement. This protocol never sends a cancel
    /// message to the producer: cancellation is carried by the
    /// ledger, so the message target here is the null target.
    async fn terminate_by_id(&self, id: &str, reason: TerminationReason) -> AgbotResult<()> {
        let lock = self.locks.for_agreement(id);
        let agreement = {
            let _guard = lock.lock().await;
            match self.find_live(id).await? {
                Some(agreement) => agreement,
                None => return Ok(()),
            }
        };

        if !self.can_cancel_now(&agreement) {
            tracing::debug!(agreement = %id, "ledger not ready for cancel, deferring");
            self.defer(AgreementWork::AgreementTimeout {
                agreement_id: id.to_string(),
                reason,
            });
            return Ok(());
        }

        if !agreement.ledger.is_empty() {
            if let Some(client) = self.registry.client(&agreement.ledger) {
                let code = self.capabilities.cancel_code(reason);
                if let Err(e) = client.cancel_agreement(id, code).await {
                    tracing::warn!(agreement = %id, error = %e, "ledger cancel failed");
                }
            }
        }

        {
            let _guard = lock.lock().await;
            self.store.archive(id, reason).await?;
        }
        self.locks.remove(id);
        tracing::info!(agreement = %id, code = reason.code(), reason = %reason, "terminated agreement");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sweep support

    /// Data-verification check for one finalized agreement. Invoked
    /// by the data-verification sweep at the agreement's own check
    /// rate.
    pub async fn verify_data(&self, agreement: &Agreement) -> AgbotResult<()> {
        let id = agreement.id.to_string();
        let received = self
            .exchange
            .data_received(&id, &agreement.device_id)
            .await?;
        if received {
            let lock = self.locks.for_agreement(&id);
            let _guard = lock.lock().await;
            if self.find_live(&id).await?.is_some() {
                self.store.data_received(&id, unix_now()).await?;
            }
            return Ok(());
        }

        let missed = agreement.dv_missed_count + 1;
        tracing::debug!(agreement = %id, missed, "data verification interval missed");
        {
            let lock = self.locks.for_agreement(&id);
            let _guard = lock.lock().await;
            if self.find_live(&id).await?.is_none() {
                return Ok(());
            }
            self.store.dv_missed(&id, missed).await?;
        }
        if missed > agreement.policy.data_verification.missed_limit {
            self.enqueue(AgreementWork::AgreementTimeout {
                agreement_id: id,
                reason: TerminationReason::NoDataReceived,
            });
        }
        Ok(())
    }

    /// Build and send the periodic metering record. Requires both
    /// proposal signatures.
    pub async fn send_metering(&self, agreement: &Agreement) -> AgbotResult<()> {
        if !agreement.can_send_meter_record() || !agreement.metering_enabled() {
            return Ok(());
        }
        let consumer_address = match self.registry.client(&agreement.ledger) {
            Some(client) => client.account().await?,
            None => String::new(),
        };
        let notification = ProtocolMessage::Metering(MeteringNotification {
            agreement_id: agreement.id.to_string(),
            proposal_hash: agreement.proposal_hash.clone(),
            consumer_sig: agreement.consumer_proposal_sig.clone(),
            producer_sig: agreement.producer_proposal_sig.clone(),
            consumer_address,
            producer_address: agreement.counterparty_address.clone(),
            creation_time: agreement.creation_time,
            check_rate_sec: agreement.dv_check_rate_sec,
            missed_count: agreement.dv_missed_count,
            ledger_kind: agreement.ledger.kind.clone(),
        });
        let target = self.exchange.device_endpoint(&agreement.device_id).await?;
        self.exchange.send(&target, &notification.to_payload()).await
    }

    // ------------------------------------------------------------------

    async fn find_live(&self, id: &str) -> AgbotResult<Option<Agreement>> {
        let filters: Vec<AgreementFilter> =
            vec![filters::unarchived(), filters::protocol(self.protocol_name())];
        Ok(self.store.find_by_id(id, &filters).await?)
    }
}

/// Typed registry of protocol handlers, keyed by protocol name and
/// owned by the top-level process.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<ConsumerProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<ConsumerProtocolHandler>) {
        self.handlers
            .insert(handler.protocol_name().to_string(), handler);
    }

    pub fn get(&self, protocol: &str) -> Option<&Arc<ConsumerProtocolHandler>> {
        self.handlers.get(protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConsumerProtocolHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
