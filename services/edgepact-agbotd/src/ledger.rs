//! HTTP adapter for ledger client containers
//!
//! Each ledger client container exposes a small signing/recording API
//! on its service endpoint. The factory binds a client when the
//! container reports writable; no network round-trip happens at bind
//! time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use edgepact_agbot::adapters::{LedgerClient, LedgerClientFactory, LedgerRecord};
use edgepact_agbot::{AgbotError, AgbotResult};
use edgepact_types::LedgerBinding;

pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    address: String,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

impl HttpLedgerClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AgbotResult<T> {
        self.client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Ledger(e.to_string()))?
            .json()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn account(&self) -> AgbotResult<String> {
        let account: AccountResponse = self.get_json("account").await?;
        Ok(account.address)
    }

    async fn sign(&self, digest: &[u8; 32]) -> AgbotResult<String> {
        let response = self
            .client
            .post(self.url("sign"))
            .json(&serde_json::json!({ "digest": hex::encode(digest) }))
            .send()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Ledger(e.to_string()))?;
        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))?;
        Ok(signed.signature)
    }

    async fn write_agreement(&self, record: &LedgerRecord) -> AgbotResult<()> {
        self.client
            .post(self.url("agreements"))
            .json(record)
            .send()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Ledger(e.to_string()))?;
        Ok(())
    }

    async fn cancel_agreement(&self, agreement_id: &str, reason_code: u32) -> AgbotResult<()> {
        self.client
            .post(self.url(&format!("agreements/{}/cancel", agreement_id)))
            .json(&serde_json::json!({ "reason": reason_code }))
            .send()
            .await
            .map_err(|e| AgbotError::Ledger(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Ledger(e.to_string()))?;
        Ok(())
    }

    async fn agreement_exists(&self, agreement_id: &str) -> AgbotResult<bool> {
        let response: ExistsResponse =
            self.get_json(&format!("agreements/{}", agreement_id)).await?;
        Ok(response.exists)
    }
}

pub struct HttpLedgerFactory;

impl LedgerClientFactory for HttpLedgerFactory {
    fn connect(
        &self,
        ledger: &LedgerBinding,
        service_endpoint: &str,
        service_port: &str,
        _local_dir: &str,
    ) -> AgbotResult<Arc<dyn LedgerClient>> {
        tracing::info!(
            org = %ledger.org, kind = %ledger.kind, name = %ledger.name,
            endpoint = service_endpoint, port = service_port,
            "binding ledger client"
        );
        Ok(Arc::new(HttpLedgerClient {
            client: reqwest::Client::new(),
            base_url: format!("http://{}:{}", service_endpoint, service_port),
        }))
    }
}
