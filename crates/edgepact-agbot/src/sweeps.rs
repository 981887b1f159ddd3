//! Periodic sweeps
//!
//! One cooperative timer driver runs three named sweeps, each with an
//! explicit interval and shared cancellation:
//!
//! 1. finalization deadline - agreements stuck in `Recording` or
//!    `RecordingFailed` past the deadline time out
//! 2. data verification - finalized agreements are checked at their
//!    own `dv_check_rate_sec`; metering records ride the same pass
//! 3. ledger presence - v2 agreements still waiting on a ledger
//!    instance re-emit the client instantiation request
//!
//! Each tick also redrives the deferred queue so that failed or
//! parked work is retried from persisted state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;

use edgepact_store::filters;
use edgepact_types::{unix_now, Agreement, AgreementState, TerminationReason};

use crate::handler::ConsumerProtocolHandler;
use crate::work::AgreementWork;

pub struct SweepDriver {
    handler: Arc<ConsumerProtocolHandler>,
    shutdown_rx: watch::Receiver<bool>,
    /// Unix seconds of the last data-verification check per agreement
    last_dv_check: HashMap<String, u64>,
    /// Unix seconds of the last metering record per agreement
    last_metering: HashMap<String, u64>,
}

impl SweepDriver {
    pub fn new(handler: Arc<ConsumerProtocolHandler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handler,
            shutdown_rx,
            last_dv_check: HashMap::new(),
            last_metering: HashMap::new(),
        }
    }

    /// Run all sweeps until shutdown is signaled.
    pub async fn run(mut self) {
        let config = self.handler.config().clone();
        let mut deadline = interval(config.deadline_sweep_interval());
        let mut dv = interval(config.dv_sweep_interval());
        let mut presence = interval(config.presence_sweep_interval());
        tracing::info!("timer driver started");

        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = deadline.tick() => {
                    self.finalization_deadline_sweep().await;
                    self.handler.drain_deferred();
                }
                _ = dv.tick() => self.data_verification_sweep().await,
                _ = presence.tick() => self.ledger_presence_sweep().await,
            }
        }
        tracing::info!("timer driver stopped");
    }

    /// Time out agreements that never made it onto the ledger.
    pub async fn finalization_deadline_sweep(&self) {
        let live = match self.live_agreements().await {
            Some(live) => live,
            None => return,
        };
        let now = unix_now();
        let deadline = self.handler.config().finalization_deadline_sec;

        for agreement in live {
            let reason = match agreement.state {
                AgreementState::Recording => TerminationReason::NotFinalizedTimeout,
                AgreementState::RecordingFailed => TerminationReason::LedgerWriteFailed,
                _ => continue,
            };
            if now < agreement.creation_time + deadline {
                continue;
            }
            tracing::info!(
                agreement = %agreement.id,
                state = %agreement.state,
                "finalization deadline exceeded"
            );
            self.handler.enqueue(AgreementWork::AgreementTimeout {
                agreement_id: agreement.id.to_string(),
                reason,
            });
        }
    }

    /// Verify data flow and send metering records for finalized
    /// agreements, each at its own rate.
    pub async fn data_verification_sweep(&mut self) {
        let live = match self.live_agreements().await {
            Some(live) => live,
            None => return,
        };
        let now = unix_now();

        // Forget agreements that are gone.
        let live_ids: std::collections::HashSet<&str> =
            live.iter().map(|a| a.id.as_str()).collect();
        self.last_dv_check.retain(|id, _| live_ids.contains(id.as_str()));
        self.last_metering.retain(|id, _| live_ids.contains(id.as_str()));

        for agreement in live {
            if !matches!(
                agreement.state,
                AgreementState::Finalized | AgreementState::DataFlowing
            ) {
                continue;
            }
            let id = agreement.id.to_string();

            if agreement.policy.data_verification.enabled {
                let basis = self
                    .last_dv_check
                    .get(&id)
                    .copied()
                    .unwrap_or(agreement.finalized_time);
                if now >= basis + agreement.dv_check_rate_sec {
                    self.last_dv_check.insert(id.clone(), now);
                    if let Err(e) = self.handler.verify_data(&agreement).await {
                        tracing::warn!(agreement = %id, error = %e, "data verification check failed");
                    }
                }

                // The ledger should still hold the agreement.
                if let Some(client) = self.handler.registry().client(&agreement.ledger) {
                    match client.agreement_exists(&id).await {
                        Ok(false) => {
                            tracing::warn!(agreement = %id, "agreement absent from the ledger");
                            self.handler.enqueue(AgreementWork::AgreementTimeout {
                                agreement_id: id.clone(),
                                reason: TerminationReason::AgreementMissing,
                            });
                            continue;
                        }
                        Ok(true) => {}
                        Err(e) => {
                            tracing::debug!(agreement = %id, error = %e, "ledger presence poll failed");
                        }
                    }
                }
            }

            if let Some(meter) = &agreement.policy.metering {
                let basis = self
                    .last_metering
                    .get(&id)
                    .copied()
                    .unwrap_or(agreement.finalized_time);
                if now >= basis + meter.notification_interval_sec {
                    self.last_metering.insert(id.clone(), now);
                    if let Err(e) = self.handler.send_metering(&agreement).await {
                        tracing::warn!(agreement = %id, error = %e, "metering notification failed");
                    }
                }
            }
        }
    }

    /// Re-request ledger clients for v2 agreements still parked on a
    /// ledger instance that is not writable.
    pub async fn ledger_presence_sweep(&self) {
        let live = match self.live_agreements().await {
            Some(live) => live,
            None => return,
        };
        for agreement in live {
            if !matches!(
                agreement.state,
                AgreementState::Replied | AgreementState::AwaitingBcReady
            ) {
                continue;
            }
            if agreement.ledger.is_empty()
                || self.handler.registry().is_writable(&agreement.ledger)
            {
                continue;
            }
            self.handler.request_new_client(&agreement.ledger);
        }
    }

    async fn live_agreements(&self) -> Option<Vec<Agreement>> {
        match self
            .handler
            .store()
            .find(&[
                filters::unarchived(),
                filters::protocol(self.handler.protocol_name()),
            ])
            .await
        {
            Ok(live) => Some(live),
            Err(e) => {
                tracing::error!(error = %e, "sweep could not query the store");
                None
            }
        }
    }
}
