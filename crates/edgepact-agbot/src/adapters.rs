//! Seams to the bot's external collaborators
//!
//! The exchange and the ledger clients are external processes. The
//! core talks to them only through these traits; production
//! implementations live in the server binary, test doubles in the
//! integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use edgepact_types::LedgerBinding;

use crate::AgbotResult;

/// Where an exchange message is delivered.
///
/// The termination path uses [`MessageTarget::null`]: this protocol
/// never sends a cancel message to the producer, cancellation rides
/// the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTarget {
    pub receiver_id: String,
    /// Receiver's X25519 public key, hex
    pub receiver_pubkey: String,
    pub endpoint: String,
}

impl MessageTarget {
    pub fn new(
        receiver_id: impl Into<String>,
        receiver_pubkey: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            receiver_pubkey: receiver_pubkey.into(),
            endpoint: endpoint.into(),
        }
    }

    /// A target that delivers nowhere.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.receiver_id.is_empty()
    }
}

/// The exchange message bus, as the bot consumes it.
#[async_trait]
pub trait ExchangeMessaging: Send + Sync {
    /// Resolve a device id to its message target.
    async fn device_endpoint(&self, device_id: &str) -> AgbotResult<MessageTarget>;

    /// Send an enveloped protocol message. Sends to a null target
    /// succeed without delivering.
    async fn send(&self, target: &MessageTarget, payload: &serde_json::Value) -> AgbotResult<()>;

    /// Whether the producer has posted workload data recently.
    async fn data_received(&self, agreement_id: &str, device_id: &str) -> AgbotResult<bool>;
}

/// Everything written to the ledger for one agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub agreement_id: String,
    pub proposal_hash: String,
    pub consumer_sig: String,
    pub producer_sig: String,
    pub consumer_address: String,
    pub producer_address: String,
}

/// The narrow signing/recording interface of one ledger client
/// instance.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// The consumer's account address on this ledger.
    async fn account(&self) -> AgbotResult<String>;

    /// Sign a 32-byte digest with the ledger account key.
    async fn sign(&self, digest: &[u8; 32]) -> AgbotResult<String>;

    /// Record an agreement on the ledger.
    async fn write_agreement(&self, record: &LedgerRecord) -> AgbotResult<()>;

    /// Record a cancellation on the ledger.
    async fn cancel_agreement(&self, agreement_id: &str, reason_code: u32) -> AgbotResult<()>;

    /// Whether the ledger currently holds the agreement.
    async fn agreement_exists(&self, agreement_id: &str) -> AgbotResult<bool>;
}

/// Connects a ledger client when its container reports writable.
/// Called inline under the registry lock, so implementations must not
/// block on the network; they bind to the already-running container.
pub trait LedgerClientFactory: Send + Sync {
    fn connect(
        &self,
        ledger: &LedgerBinding,
        service_endpoint: &str,
        service_port: &str,
        local_dir: &str,
    ) -> AgbotResult<Arc<dyn LedgerClient>>;
}
