//! Ledger client registry
//!
//! A three-level directory `org → kind → name → ClientState` tracking
//! which ledger client instances are ready and writable. All access
//! goes through one mutex; callers never hold a `ClientState`
//! reference across a suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use edgepact_types::LedgerBinding;

use crate::adapters::{LedgerClient, LedgerClientFactory};
use crate::AgbotResult;

/// Readiness state of one ledger client instance.
pub struct ClientState {
    pub ready: bool,
    pub writable: bool,
    pub service_endpoint: String,
    pub service_port: String,
    pub local_dir: String,
    /// Bound client handle; present exactly when ready
    pub client: Option<Arc<dyn LedgerClient>>,
}

type NameMap = HashMap<String, ClientState>;

pub struct LedgerClientRegistry {
    state: Mutex<HashMap<String, HashMap<String, NameMap>>>,
    factory: Arc<dyn LedgerClientFactory>,
}

impl LedgerClientRegistry {
    pub fn new(factory: Arc<dyn LedgerClientFactory>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Remove the entry for a stopping client.
    pub fn set_not_available(&self, ledger: &LedgerBinding) {
        let mut state = self.state.lock();
        if let Some(kinds) = state.get_mut(&ledger.org) {
            if let Some(names) = kinds.get_mut(&ledger.kind) {
                names.remove(&ledger.name);
            }
        }
    }

    /// Upsert an entry as ready and writable, binding a client handle
    /// for it. Client initialization happens inline.
    pub fn set_writable(
        &self,
        ledger: &LedgerBinding,
        service_endpoint: &str,
        service_port: &str,
        local_dir: &str,
    ) -> AgbotResult<()> {
        let client = self
            .factory
            .connect(ledger, service_endpoint, service_port, local_dir)?;

        let mut state = self.state.lock();
        let names = state
            .entry(ledger.org.clone())
            .or_default()
            .entry(ledger.kind.clone())
            .or_default();
        names.insert(
            ledger.name.clone(),
            ClientState {
                ready: true,
                writable: true,
                service_endpoint: service_endpoint.to_string(),
                service_port: service_port.to_string(),
                local_dir: local_dir.to_string(),
                client: Some(client),
            },
        );
        tracing::info!(
            org = %ledger.org,
            kind = %ledger.kind,
            name = %ledger.name,
            "ledger client is writable"
        );
        Ok(())
    }

    pub fn is_ready(&self, ledger: &LedgerBinding) -> bool {
        self.with_entry(ledger, |entry| entry.ready).unwrap_or(false)
    }

    pub fn is_writable(&self, ledger: &LedgerBinding) -> bool {
        self.with_entry(ledger, |entry| entry.ready && entry.writable)
            .unwrap_or(false)
    }

    /// The bound client handle for a ready entry.
    pub fn client(&self, ledger: &LedgerBinding) -> Option<Arc<dyn LedgerClient>> {
        self.with_entry(ledger, |entry| {
            if entry.ready {
                entry.client.clone()
            } else {
                None
            }
        })
        .flatten()
    }

    /// The bot-side filesystem location for a ready entry.
    pub fn local_dir(&self, ledger: &LedgerBinding) -> String {
        self.with_entry(ledger, |entry| {
            if entry.ready {
                entry.local_dir.clone()
            } else {
                String::new()
            }
        })
        .unwrap_or_default()
    }

    fn with_entry<T>(&self, ledger: &LedgerBinding, read: impl FnOnce(&ClientState) -> T) -> Option<T> {
        let state = self.state.lock();
        state
            .get(&ledger.org)
            .and_then(|kinds| kinds.get(&ledger.kind))
            .and_then(|names| names.get(&ledger.name))
            .map(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LedgerRecord;
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl LedgerClient for NullClient {
        async fn account(&self) -> AgbotResult<String> {
            Ok("0xconsumer".to_string())
        }
        async fn sign(&self, _digest: &[u8; 32]) -> AgbotResult<String> {
            Ok("sig".to_string())
        }
        async fn write_agreement(&self, _record: &LedgerRecord) -> AgbotResult<()> {
            Ok(())
        }
        async fn cancel_agreement(&self, _agreement_id: &str, _reason_code: u32) -> AgbotResult<()> {
            Ok(())
        }
        async fn agreement_exists(&self, _agreement_id: &str) -> AgbotResult<bool> {
            Ok(true)
        }
    }

    struct NullFactory;

    impl LedgerClientFactory for NullFactory {
        fn connect(
            &self,
            _ledger: &LedgerBinding,
            _service_endpoint: &str,
            _service_port: &str,
            _local_dir: &str,
        ) -> AgbotResult<Arc<dyn LedgerClient>> {
            Ok(Arc::new(NullClient))
        }
    }

    fn registry() -> LedgerClientRegistry {
        LedgerClientRegistry::new(Arc::new(NullFactory))
    }

    #[test]
    fn missing_entries_read_as_not_ready() {
        let reg = registry();
        let ledger = LedgerBinding::new("eth", "bc1", "acme");
        assert!(!reg.is_ready(&ledger));
        assert!(!reg.is_writable(&ledger));
        assert!(reg.client(&ledger).is_none());
        assert_eq!(reg.local_dir(&ledger), "");
    }

    #[test]
    fn set_writable_binds_a_client() {
        let reg = registry();
        let ledger = LedgerBinding::new("eth", "bc1", "acme");
        reg.set_writable(&ledger, "10.0.0.4", "8545", "/var/edgepact/bc1").unwrap();

        assert!(reg.is_ready(&ledger));
        assert!(reg.is_writable(&ledger));
        assert!(reg.client(&ledger).is_some());
        assert_eq!(reg.local_dir(&ledger), "/var/edgepact/bc1");
    }

    #[test]
    fn set_not_available_removes_the_entry() {
        let reg = registry();
        let ledger = LedgerBinding::new("eth", "bc1", "acme");
        reg.set_writable(&ledger, "10.0.0.4", "8545", "/d").unwrap();
        reg.set_not_available(&ledger);
        assert!(!reg.is_ready(&ledger));

        // Removing a never-registered entry is harmless.
        reg.set_not_available(&LedgerBinding::new("eth", "bc9", "acme"));
    }

    #[test]
    fn entries_are_keyed_by_the_full_triple() {
        let reg = registry();
        reg.set_writable(&LedgerBinding::new("eth", "bc1", "acme"), "e", "p", "d").unwrap();

        assert!(!reg.is_ready(&LedgerBinding::new("eth", "bc1", "other")));
        assert!(!reg.is_ready(&LedgerBinding::new("fabric", "bc1", "acme")));
        assert!(!reg.is_ready(&LedgerBinding::new("eth", "bc2", "acme")));
    }
}
