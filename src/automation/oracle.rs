//! Best-effort price and liquidity lookups

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::work_unit::WorkUnit;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    #[serde(default)]
    pub liquidity: Option<f64>,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// `None` when the oracle has nothing usable for `mint`
    async fn quote(&self, mint: &str) -> Option<PriceQuote>;
}

/// `GET {base_url}/{mint}` returning `{"price": .., "liquidity": ..}`
pub struct HttpPriceOracle {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPriceOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn quote(&self, mint: &str) -> Option<PriceQuote> {
        let url = format!("{}/{}", self.base_url, mint);
        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(mint = %mint, status = r.status().as_u16(), "Oracle returned non-success");
                return None;
            }
            Err(e) => {
                debug!(mint = %mint, error = %e, "Oracle unreachable");
                return None;
            }
        };
        response
            .json::<PriceQuote>()
            .await
            .ok()
            .filter(|q| q.price.is_finite() && q.price > 0.0)
    }
}

/// Oracle that never answers; every lookup falls back to the persisted price
pub struct NoOracle;

#[async_trait]
impl PriceOracle for NoOracle {
    async fn quote(&self, _mint: &str) -> Option<PriceQuote> {
        None
    }
}

/// Current price, else the unit's last persisted one
pub async fn price_or_last(oracle: &dyn PriceOracle, unit: &WorkUnit) -> Option<f64> {
    match oracle.quote(&unit.mint).await {
        Some(quote) => Some(quote.price),
        None => {
            debug!(unit_id = %unit.id, "Using last known price");
            unit.last_known_price
        }
    }
}
