//! Core runtime settings
//!
//! The server binary loads these from its layered configuration and
//! hands them to the handler, worker pool and timer driver.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for one agreement bot instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgbotConfig {
    /// Exchange identity of this bot
    pub bot_id: String,

    /// Exchange credential handed to new ledger client containers
    pub token: String,

    /// Base URL of the exchange
    pub exchange_url: String,

    /// Directory generated policy files are written under
    pub policy_path: PathBuf,

    /// Number of agreement workers draining the work channel
    #[serde(default = "default_workers")]
    pub agreement_workers: usize,

    /// Seconds an agreement may sit unrecorded before timing out
    #[serde(default = "default_finalization_deadline")]
    pub finalization_deadline_sec: u64,

    /// Interval of the finalization-deadline sweep
    #[serde(default = "default_deadline_sweep")]
    pub deadline_sweep_sec: u64,

    /// Interval of the data-verification sweep
    #[serde(default = "default_dv_sweep")]
    pub dv_sweep_sec: u64,

    /// Interval of the ledger-presence sweep
    #[serde(default = "default_presence_sweep")]
    pub presence_sweep_sec: u64,
}

fn default_workers() -> usize {
    4
}

fn default_finalization_deadline() -> u64 {
    600
}

fn default_deadline_sweep() -> u64 {
    30
}

fn default_dv_sweep() -> u64 {
    60
}

fn default_presence_sweep() -> u64 {
    120
}

impl AgbotConfig {
    pub fn deadline_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.deadline_sweep_sec.max(1))
    }

    pub fn dv_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dv_sweep_sec.max(1))
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence_sweep_sec.max(1))
    }
}

impl Default for AgbotConfig {
    fn default() -> Self {
        Self {
            bot_id: "edgepact-agbot".to_string(),
            token: String::new(),
            exchange_url: "http://localhost:8080".to_string(),
            policy_path: PathBuf::from("/var/edgepact/policy"),
            agreement_workers: default_workers(),
            finalization_deadline_sec: default_finalization_deadline(),
            deadline_sweep_sec: default_deadline_sweep(),
            dv_sweep_sec: default_dv_sweep(),
            presence_sweep_sec: default_presence_sweep(),
        }
    }
}
