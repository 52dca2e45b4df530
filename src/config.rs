use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::billing::domain::ReconnectBackoff;
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::types::ProductId;

fn default_reconnect_floor_ms() -> u64 {
    1_000
}

fn default_reconnect_ceiling_ms() -> u64 {
    15 * 60 * 1_000
}

fn default_details_stale_after_secs() -> u64 {
    4 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    5
}

/// Product lists and tuning knobs for a billing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default)]
    pub regular_ids: Vec<ProductId>,
    #[serde(default)]
    pub subscription_ids: Vec<ProductId>,
    /// Regular products consumed as soon as they are granted.
    #[serde(default)]
    pub auto_consume_ids: Vec<ProductId>,
    /// Hex-encoded ed25519 key purchase signatures are checked against.
    pub public_key: String,

    #[serde(default = "default_reconnect_floor_ms")]
    pub reconnect_floor_ms: u64,
    #[serde(default = "default_reconnect_ceiling_ms")]
    pub reconnect_ceiling_ms: u64,
    #[serde(default = "default_details_stale_after_secs")]
    pub details_stale_after_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl BillingConfig {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            regular_ids: Vec::new(),
            subscription_ids: Vec::new(),
            auto_consume_ids: Vec::new(),
            public_key: public_key.into(),
            reconnect_floor_ms: default_reconnect_floor_ms(),
            reconnect_ceiling_ms: default_reconnect_ceiling_ms(),
            details_stale_after_secs: default_details_stale_after_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        let regular: BTreeSet<&ProductId> = self.regular_ids.iter().collect();

        if let Some(id) = self.subscription_ids.iter().find(|id| regular.contains(id)) {
            return Err(BillingError::InvalidConfig(format!(
                "{} listed as both regular product and subscription",
                id
            )));
        }
        if let Some(id) = self.auto_consume_ids.iter().find(|id| !regular.contains(id)) {
            return Err(BillingError::InvalidConfig(format!(
                "auto-consume product {} is not a regular product",
                id
            )));
        }
        if self.reconnect_floor_ms == 0 || self.reconnect_floor_ms > self.reconnect_ceiling_ms {
            return Err(BillingError::InvalidConfig(format!(
                "reconnect floor {}ms must be positive and at most the ceiling {}ms",
                self.reconnect_floor_ms, self.reconnect_ceiling_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(BillingError::InvalidConfig("poll interval must be positive".into()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(self.reconnect_floor_ms),
            Duration::from_millis(self.reconnect_ceiling_ms),
        )
    }

    pub fn details_stale_after(&self) -> Duration {
        Duration::from_secs(self.details_stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
