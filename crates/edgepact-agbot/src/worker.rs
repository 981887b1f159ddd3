//! The agreement worker pool
//!
//! `N` workers drain one shared work channel. A worker processes one
//! item at a time; per-agreement serialization happens inside the
//! handler via the agreement lock manager. Shutdown is cooperative:
//! a worker finishes its current item and exits before dequeuing the
//! next.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::handler::ConsumerProtocolHandler;
use crate::work::AgreementWork;
use crate::{AgbotError, AgbotResult};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn the configured number of workers over the handler's work
    /// channel. The channel receiver can only be taken once.
    pub fn start(handler: Arc<ConsumerProtocolHandler>, workers: usize) -> AgbotResult<Self> {
        let work_rx = handler
            .take_work_receiver()
            .ok_or_else(|| AgbotError::Fatal("work channel already claimed".to_string()))?;
        let shared_rx = Arc::new(Mutex::new(work_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..workers.max(1) {
            let worker_id = uuid::Uuid::new_v4().to_string();
            handles.push(tokio::spawn(agreement_worker(
                worker_id,
                handler.clone(),
                shared_rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tracing::info!(workers = workers.max(1), "agreement worker pool started");
        Ok(Self {
            handles,
            shutdown_tx,
        })
    }

    /// Signal shutdown and wait for every worker to finish its
    /// current item.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("agreement worker pool stopped");
    }
}

async fn agreement_worker(
    worker_id: String,
    handler: Arc<ConsumerProtocolHandler>,
    shared_rx: Arc<Mutex<mpsc::UnboundedReceiver<AgreementWork>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::debug!(worker = %worker_id, "agreement worker started");
    loop {
        let work = {
            let mut rx = shared_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => None,
                work = rx.recv() => work,
            }
        };
        let Some(work) = work else {
            break;
        };

        let label = work.label();
        let agreement = work.agreement_id().map(str::to_string);
        match handler.process(work).await {
            Ok(()) => {}
            // Malformed input is expected noise; everything else is a
            // failed item the sweeps will redrive.
            Err(AgbotError::Validation(message)) => {
                tracing::debug!(worker = %worker_id, kind = label, message, "dropped invalid work item");
            }
            Err(e) => {
                tracing::warn!(
                    worker = %worker_id,
                    kind = label,
                    agreement = agreement.as_deref().unwrap_or(""),
                    error = %e,
                    "agreement work failed"
                );
            }
        }
    }
    tracing::debug!(worker = %worker_id, "agreement worker stopped");
}
