//! The command router
//!
//! Classifies inbound bus events, gates ledger events on client
//! readiness, applies registry updates, and enqueues typed work on
//! the owning protocol handler. During shutdown the router stops
//! accepting and everything inbound is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edgepact_types::BusEvent;

use crate::handler::HandlerRegistry;
use crate::work::AgreementWork;

pub struct CommandRouter {
    handlers: Arc<HandlerRegistry>,
    accepting: AtomicBool,
}

impl CommandRouter {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop accepting inbound events; the first step of shutdown.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Classify one inbound event and hand it to the handlers that
    /// accept it.
    pub async fn route(&self, event: BusEvent) {
        if !self.is_accepting() {
            tracing::debug!(event = %event.summary(), "router shutting down, dropping event");
            return;
        }
        tracing::debug!(event = %event.summary(), "routing event");

        match event {
            // Registry lifecycle updates apply to every handler.
            BusEvent::ClientInitialized { ledger } => {
                // Readiness for writing arrives with the funding event.
                tracing::debug!(
                    org = %ledger.org, kind = %ledger.kind, name = %ledger.name,
                    "ledger client initialized"
                );
            }
            BusEvent::ClientStopping { ledger } => {
                for handler in self.handlers.iter() {
                    handler.client_not_available(&ledger);
                }
            }
            BusEvent::AccountFunded {
                ledger,
                service_endpoint,
                service_port,
                local_dir,
            } => {
                for handler in self.handlers.iter() {
                    if let Err(e) = handler
                        .client_writable(&ledger, &service_endpoint, &service_port, &local_dir)
                        .await
                    {
                        tracing::error!(
                            org = %ledger.org, kind = %ledger.kind, name = %ledger.name,
                            error = %e,
                            "failed to register writable ledger client"
                        );
                    }
                }
            }

            BusEvent::NewProtocolMessage { payload, from, message_id, .. } => {
                for handler in self.handlers.iter() {
                    match handler.handle_protocol_message(&payload) {
                        Ok(()) => return,
                        Err(e) => {
                            tracing::debug!(
                                from = %from, message_id = %message_id, error = %e,
                                "protocol message not classified, dropping"
                            );
                        }
                    }
                }
            }

            BusEvent::BlockchainEvent { ledger, raw } => {
                for handler in self.handlers.iter() {
                    let event = BusEvent::BlockchainEvent {
                        ledger: ledger.clone(),
                        raw: raw.clone(),
                    };
                    if handler.accept_command(&event) {
                        handler.handle_ledger_event(&raw);
                    } else {
                        tracing::debug!(
                            org = %ledger.org, kind = %ledger.kind, name = %ledger.name,
                            "ledger not ready, dropping event"
                        );
                    }
                }
            }

            BusEvent::AgreementTimeout { agreement_id, reason } => {
                for handler in self.handlers.iter() {
                    handler.enqueue(AgreementWork::AgreementTimeout {
                        agreement_id: agreement_id.clone(),
                        reason,
                    });
                }
            }

            BusEvent::PolicyChanged { org, policy_name } => {
                for handler in self.handlers.iter() {
                    handler.enqueue(AgreementWork::PolicyChanged {
                        org: org.clone(),
                        policy_name: policy_name.clone(),
                    });
                }
            }

            BusEvent::PolicyDeleted { org, policy_name } => {
                for handler in self.handlers.iter() {
                    handler.enqueue(AgreementWork::PolicyDeleted {
                        org: org.clone(),
                        policy_name: policy_name.clone(),
                    });
                }
            }

            BusEvent::WorkloadUpgrade { agreement_id, .. } => {
                for handler in self.handlers.iter() {
                    handler.enqueue(AgreementWork::WorkloadUpgrade {
                        agreement_id: agreement_id.clone(),
                    });
                }
            }

            BusEvent::MakeAgreement { device_id, policy } => {
                let protocol = policy
                    .agreement_protocols
                    .first()
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                match self.handlers.get(&protocol) {
                    Some(handler) => handler.enqueue(AgreementWork::MakeProposal {
                        device_id,
                        policy,
                    }),
                    None => {
                        tracing::warn!(
                            protocol = %protocol, device = %device_id,
                            "no handler registered for policy protocol"
                        );
                    }
                }
            }
        }
    }
}
