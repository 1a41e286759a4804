//! Work units and upstream trigger events

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::fixed_point::FixedAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationKind {
    /// Periodically add liquidity from a funding wallet
    LiquidityTopUp,
    /// Sweep accrued fees from the funding wallet to a destination
    FeeHarvest,
    /// Burn a share of each landed top-up
    TokenBurn,
}

impl AutomationKind {
    pub const ALL: [AutomationKind; 3] = [
        AutomationKind::LiquidityTopUp,
        AutomationKind::FeeHarvest,
        AutomationKind::TokenBurn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationKind::LiquidityTopUp => "liquidity_top_up",
            AutomationKind::FeeHarvest => "fee_harvest",
            AutomationKind::TokenBurn => "token_burn",
        }
    }
}

impl fmt::Display for AutomationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which liquidity venue a token trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    PreGraduation,
    PostGraduation,
}

/// One automated entity, evaluated every pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub kind: AutomationKind,
    pub mint: String,
    pub enabled: bool,
    pub rate_percent: f64,
    pub interval_seconds: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cumulative_total: FixedAmount,
    /// Quote-denominated running value for dashboards
    #[serde(default)]
    pub cumulative_value: FixedAmount,
    #[serde(default)]
    pub execution_count: u64,
    pub last_amount: Option<FixedAmount>,
    /// Funding wallet public key
    pub source_wallet: String,
    /// base64 `nonce || ciphertext` of the wallet's secret key
    pub encrypted_key: String,
    pub session_id: Option<String>,
    /// Recipient for fee harvests
    pub destination: Option<String>,
    #[serde(default)]
    pub stage: LifecycleStage,
    #[serde(default)]
    pub min_trigger: FixedAmount,
    pub max_per_interval: Option<FixedAmount>,
    /// Recent activity (e.g. 24h volume) used by discovery
    #[serde(default)]
    pub activity: f64,
    pub last_known_price: Option<f64>,
}

impl WorkUnit {
    /// Enabled and its interval has elapsed since the last execution
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_executed_at {
            None => true,
            Some(last) => {
                let interval = ChronoDuration::seconds(self.interval_seconds.min(i64::MAX as u64) as i64);
                now.signed_duration_since(last) >= interval
            }
        }
    }
}

/// Upstream event a burn is derived from, e.g. a landed top-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: String,
    pub unit_id: String,
    pub amount: FixedAmount,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TriggerEvent {
    pub fn new(unit_id: &str, amount: FixedAmount, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            unit_id: unit_id.to_string(),
            amount,
            observed_at,
            processed: false,
            processed_at: None,
        }
    }
}
