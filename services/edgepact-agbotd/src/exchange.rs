//! HTTP adapter for the exchange
//!
//! Thin client over the exchange REST API: resolves device message
//! endpoints, delivers enveloped protocol messages, checks data
//! receipts and polls the bot's event feed.

use async_trait::async_trait;
use serde::Deserialize;

use edgepact_agbot::adapters::{ExchangeMessaging, MessageTarget};
use edgepact_agbot::{AgbotError, AgbotResult};
use edgepact_crypto::{seal, KeyPair};
use edgepact_types::BusEvent;

pub struct HttpExchange {
    client: reqwest::Client,
    base_url: String,
    bot_id: String,
    token: String,
    keypair: KeyPair,
}

#[derive(Deserialize)]
struct DeviceEndpointResponse {
    msg_endpoint: String,
    public_key: String,
}

#[derive(Deserialize)]
struct EventFeedResponse {
    #[serde(default)]
    events: Vec<BusEvent>,
}

impl HttpExchange {
    pub fn new(base_url: String, bot_id: String, token: String, keypair: KeyPair) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            bot_id,
            token,
            keypair,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Drain the bot's pending event feed.
    pub async fn poll_events(&self) -> AgbotResult<Vec<BusEvent>> {
        let url = self.url(&format!("agbots/{}/events", self.bot_id));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        let feed: EventFeedResponse = response
            .json()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        Ok(feed.events)
    }
}

#[async_trait]
impl ExchangeMessaging for HttpExchange {
    async fn device_endpoint(&self, device_id: &str) -> AgbotResult<MessageTarget> {
        let url = self.url(&format!("devices/{}/endpoint", device_id));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        let endpoint: DeviceEndpointResponse = response
            .json()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        Ok(MessageTarget::new(
            device_id,
            endpoint.public_key,
            endpoint.msg_endpoint,
        ))
    }

    async fn send(&self, target: &MessageTarget, payload: &serde_json::Value) -> AgbotResult<()> {
        if target.is_null() {
            // Termination never messages the producer; the ledger
            // carries cancellation.
            return Ok(());
        }
        let envelope = seal(payload, &self.keypair, &target.receiver_pubkey)?;
        let url = self.url(&format!("msgs/{}", target.receiver_id));
        self.client
            .post(&url)
            .basic_auth(&self.bot_id, Some(&self.token))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        Ok(())
    }

    async fn data_received(&self, agreement_id: &str, device_id: &str) -> AgbotResult<bool> {
        let url = self.url(&format!(
            "agreements/{}/data?device={}",
            agreement_id, device_id
        ));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::Exchange(e.to_string()))?;
        Ok(response.status().is_success())
    }
}
