//! Configuration module
//!
//! Two sources, both read once at startup and then passed explicitly into
//! component constructors:
//!
//! - [`RelayConfig`]: engine endpoints, auth and retry tuning from
//!   environment-style `RELAY_*` keys (`.env` is honoured via `dotenvy`).
//! - [`AutomationConfig`]: scheduled-engine settings from a TOML file.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::automation::orchestrator::OrchestratorSettings;
use crate::automation::work_unit::AutomationKind;
use crate::ledger::fixed_point::FixedAmount;
use crate::relay::backoff::BackoffConfig;
use crate::relay::confirmation::ConfirmationPoller;
use crate::relay::failover::SendOptions;
use crate::relay::engine::{parse_endpoint_list, SubmitMethod, ENGINE_BLOXROUTE, ENGINE_DIRECT, ENGINE_JITO};
use crate::relay::submitter::{SubmitterConfig, DEFAULT_MAX_ATTEMPTS, MAX_ATTEMPTS_CEILING};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP client setup failed: {0}")]
    Http(String),
}

/// Raw per-engine settings as read from the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub key: String,
    pub label: Option<String>,
    /// Normalized endpoint URLs, primary first
    pub endpoints: Vec<String>,
    pub status_url: Option<String>,
    #[serde(default)]
    pub method: SubmitMethod,
    pub auth_bearer: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// `user:pass`
    pub basic_auth: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Overrides the global shuffle flag when set
    pub shuffle: Option<bool>,
    pub dry_run: Option<bool>,
}

impl EngineSettings {
    pub fn new(key: &str, endpoints: Vec<String>) -> Self {
        Self {
            key: key.to_lowercase(),
            label: None,
            endpoints,
            status_url: None,
            method: SubmitMethod::Bundle,
            auth_bearer: None,
            api_key: None,
            api_key_header: default_api_key_header(),
            basic_auth: None,
            tls_cert: None,
            tls_key: None,
            shuffle: None,
            dry_run: None,
        }
    }
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Immutable relay configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub engines: Vec<EngineSettings>,
    pub default_engine: String,
    /// Explicit priority order; when absent the registry falls back to its default order
    pub engine_order: Option<Vec<String>>,
    pub shuffle_endpoints: bool,
    pub dry_run: bool,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
    pub confirm_interval: Duration,
    pub confirm_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            default_engine: ENGINE_JITO.to_string(),
            engine_order: None,
            shuffle_endpoints: false,
            dry_run: false,
            max_retries: DEFAULT_MAX_ATTEMPTS,
            request_timeout: Duration::from_millis(30_000),
            backoff: BackoffConfig::default(),
            confirm_interval: Duration::from_millis(2_000),
            confirm_timeout: Duration::from_millis(60_000),
        }
    }
}

/// Key/value view with typed getters; blank values count as unset
struct EnvView(HashMap<String, String>);

impl EnvView {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|v| match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("expected a boolean, got '{}'", other),
                }),
            })
            .transpose()
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|v| {
                v.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

impl RelayConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = EnvView(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        let defaults = Self::default();

        let keys = env.list("RELAY_ENGINES").unwrap_or_else(|| {
            vec![
                ENGINE_JITO.to_string(),
                ENGINE_DIRECT.to_string(),
                ENGINE_BLOXROUTE.to_string(),
            ]
        });
        let engines = keys
            .iter()
            .map(|key| engine_settings(&env, key))
            .collect::<Result<Vec<_>, _>>()?;

        let requested_retries = env
            .parse::<u32>("RELAY_MAX_RETRIES")?
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if requested_retries > MAX_ATTEMPTS_CEILING {
            warn!(
                requested = requested_retries,
                ceiling = MAX_ATTEMPTS_CEILING,
                "RELAY_MAX_RETRIES above ceiling, clamping"
            );
        }

        let config = Self {
            engines,
            default_engine: env
                .get("RELAY_DEFAULT_ENGINE")
                .map(str::to_lowercase)
                .unwrap_or(defaults.default_engine),
            engine_order: env.list("RELAY_ENGINE_ORDER"),
            shuffle_endpoints: env.bool("RELAY_SHUFFLE_ENDPOINTS")?.unwrap_or(false),
            dry_run: env.bool("RELAY_DRY_RUN")?.unwrap_or(false),
            max_retries: requested_retries.clamp(1, MAX_ATTEMPTS_CEILING),
            request_timeout: env
                .parse::<u64>("RELAY_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            backoff: backoff_settings(&env)?,
            confirm_interval: env
                .parse::<u64>("RELAY_CONFIRM_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.confirm_interval),
            confirm_timeout: env
                .parse::<u64>("RELAY_CONFIRM_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.confirm_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate().map_err(ConfigError::Invalid)?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_REQUEST_TIMEOUT_MS".into(),
                reason: "must be positive".into(),
            });
        }
        if self.confirm_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_CONFIRM_INTERVAL_MS".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn submitter_config(&self) -> SubmitterConfig {
        SubmitterConfig::new(self.max_retries, self.request_timeout)
    }

    pub fn poller(&self) -> ConfirmationPoller {
        ConfirmationPoller::new(self.confirm_interval, self.confirm_timeout)
    }
}

fn engine_settings(env: &EnvView, key: &str) -> Result<EngineSettings, ConfigError> {
    let prefix = format!("RELAY_{}", key.to_uppercase().replace('-', "_"));
    let var = |suffix: &str| format!("{}_{}", prefix, suffix);

    let endpoints = env
        .get(&var("ENDPOINTS"))
        .map(parse_endpoint_list)
        .unwrap_or_default();
    let method = match env.get(&var("METHOD")) {
        Some(raw) => SubmitMethod::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: var("METHOD"),
            reason: format!("expected 'bundle' or 'transaction', got '{}'", raw),
        })?,
        None => SubmitMethod::Bundle,
    };
    let basic_auth = env.string(&var("BASIC_AUTH"));
    if let Some(basic) = &basic_auth {
        if !basic.contains(':') {
            return Err(ConfigError::InvalidValue {
                key: var("BASIC_AUTH"),
                reason: "expected 'user:pass'".into(),
            });
        }
    }

    Ok(EngineSettings {
        key: key.to_lowercase(),
        label: env.string(&var("LABEL")),
        endpoints,
        status_url: env.string(&var("STATUS_URL")),
        method,
        auth_bearer: env.string(&var("AUTH_BEARER")),
        api_key: env.string(&var("API_KEY")),
        api_key_header: env
            .string(&var("API_KEY_HEADER"))
            .unwrap_or_else(default_api_key_header),
        basic_auth,
        tls_cert: env.string(&var("TLS_CERT")),
        tls_key: env.string(&var("TLS_KEY")),
        shuffle: env.bool(&var("SHUFFLE"))?,
        dry_run: env.bool(&var("DRY_RUN"))?,
    })
}

fn backoff_settings(env: &EnvView) -> Result<BackoffConfig, ConfigError> {
    let mut cfg = BackoffConfig::default();
    macro_rules! override_field {
        ($key:literal, $ty:ty, $field:expr) => {
            if let Some(v) = env.parse::<$ty>(concat!("RELAY_BACKOFF_", $key))? {
                $field = v;
            }
        };
    }
    override_field!("RATE_LIMIT_BASE_MS", u64, cfg.rate_limit_base_ms);
    override_field!("RATE_LIMIT_FACTOR", f64, cfg.rate_limit_factor);
    override_field!("BACKEND_STEP_MS", u64, cfg.backend_step_ms);
    override_field!("BLOCKHASH_STEP_MS", u64, cfg.blockhash_step_ms);
    override_field!("NETWORK_STEP_MS", u64, cfg.network_step_ms);
    override_field!("GENERIC_STEP_MS", u64, cfg.generic_step_ms);
    override_field!("RATE_LIMIT_CAP_MS", u64, cfg.caps.rate_limit_ms);
    override_field!("BACKEND_CAP_MS", u64, cfg.caps.backend_ms);
    override_field!("BLOCKHASH_CAP_MS", u64, cfg.caps.blockhash_ms);
    override_field!("NETWORK_CAP_MS", u64, cfg.caps.network_ms);
    override_field!("GENERIC_CAP_MS", u64, cfg.caps.generic_ms);
    override_field!("MIN_WAIT_MS", u64, cfg.min_wait_ms);
    override_field!("JITTER_MIN", f64, cfg.jitter_min);
    override_field!("JITTER_MAX", f64, cfg.jitter_max);
    override_field!("MAX_RETRY_AFTER_MS", u64, cfg.max_retry_after_ms);
    Ok(cfg)
}

/// Scheduled-engine configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub rpc: RpcSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub schedule: ScheduleSettings,

    pub venue: VenueSettings,

    #[serde(default)]
    pub oracle: OracleSettings,

    #[serde(default)]
    pub signer: SignerSettings,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    pub url: String,

    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Seconds between passes in `run` mode
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,

    #[serde(default = "default_inter_unit_delay_ms")]
    pub inter_unit_delay_ms: u64,

    /// Units below this activity level are not discovered
    #[serde(default)]
    pub min_activity: f64,

    #[serde(default = "default_max_failure_reasons")]
    pub max_failure_reasons: usize,

    /// Kinds to run each pass
    #[serde(default = "default_kinds")]
    pub kinds: Vec<AutomationKind>,

    /// Age after which an in-flight marker is considered abandoned
    #[serde(default = "default_in_flight_ttl_secs")]
    pub in_flight_ttl_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cadence_secs: default_cadence_secs(),
            inter_unit_delay_ms: default_inter_unit_delay_ms(),
            min_activity: 0.0,
            max_failure_reasons: default_max_failure_reasons(),
            kinds: default_kinds(),
            in_flight_ttl_secs: default_in_flight_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSettings {
    /// Bonding-curve program used before graduation
    pub pre_graduation_program: String,

    /// AMM program used after graduation
    pub post_graduation_program: String,

    #[serde(default = "default_compute_unit_limit")]
    pub compute_unit_limit: u32,

    #[serde(default = "default_compute_unit_price")]
    pub compute_unit_price_micro_lamports: u64,

    /// Lamports kept in the funding wallet for fees
    #[serde(default = "default_fee_reserve_lamports")]
    pub fee_reserve_lamports: u64,

    pub tip_account: Option<String>,

    #[serde(default)]
    pub tip_lamports: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSettings {
    pub url: Option<String>,

    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerSettings {
    /// Environment variable holding the per-installation secret
    #[serde(default = "default_secret_env")]
    pub installation_secret_env: String,

    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            installation_secret_env: default_secret_env(),
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_rpc_timeout_ms() -> u64 { 30_000 }
fn default_store_path() -> String { "data/ledger".to_string() }
fn default_cadence_secs() -> u64 { 60 }
fn default_inter_unit_delay_ms() -> u64 { 250 }
fn default_max_failure_reasons() -> usize { 5 }
fn default_kinds() -> Vec<AutomationKind> { AutomationKind::ALL.to_vec() }
fn default_in_flight_ttl_secs() -> u64 { 300 }
fn default_compute_unit_limit() -> u32 { 200_000 }
fn default_compute_unit_price() -> u64 { 100_000 }
fn default_fee_reserve_lamports() -> u64 { 5_000_000 }
fn default_oracle_timeout_ms() -> u64 { 5_000 }
fn default_secret_env() -> String { "RELAY_INSTALLATION_SECRET".to_string() }
fn default_kdf_memory_kib() -> u32 { 19_456 }
fn default_kdf_iterations() -> u32 { 2 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl AutomationConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AutomationConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.url.trim().is_empty() {
            return Err(ConfigError::Missing("rpc.url".into()));
        }
        parse_pubkey("venue.pre_graduation_program", &self.venue.pre_graduation_program)?;
        parse_pubkey("venue.post_graduation_program", &self.venue.post_graduation_program)?;
        if let Some(tip) = &self.venue.tip_account {
            parse_pubkey("venue.tip_account", tip)?;
        }
        if self.schedule.cadence_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "schedule.cadence_secs".into(),
                reason: "must be positive".into(),
            });
        }
        if self.schedule.kinds.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "schedule.kinds".into(),
                reason: "at least one automation kind is required".into(),
            });
        }
        Ok(())
    }

    pub fn installation_secret(&self) -> Result<zeroize::Zeroizing<String>, ConfigError> {
        std::env::var(&self.signer.installation_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(zeroize::Zeroizing::new)
            .ok_or_else(|| ConfigError::Missing(self.signer.installation_secret_env.clone()))
    }

    /// Pass settings from `[schedule]` and `[venue]`
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            inter_unit_delay: Duration::from_millis(self.schedule.inter_unit_delay_ms),
            min_activity: self.schedule.min_activity,
            fee_reserve: FixedAmount::from_lamports(self.venue.fee_reserve_lamports),
            max_failure_reasons: self.schedule.max_failure_reasons,
            in_flight_ttl: Duration::from_secs(self.schedule.in_flight_ttl_secs),
            send_options: SendOptions::default(),
        }
    }
}

pub(crate) fn parse_pubkey(key: &str, raw: &str) -> Result<Pubkey, ConfigError> {
    Pubkey::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
