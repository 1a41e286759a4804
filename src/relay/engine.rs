//! Engine registry
//!
//! An engine is one relay service: an ordered endpoint list, auth headers and
//! submission flags. Engines are built once from [`RelayConfig`] and never
//! mutated afterwards, so the registry is shared freely behind an `Arc`.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ConfigError, EngineSettings, RelayConfig};

pub const ENGINE_JITO: &str = "jito";
pub const ENGINE_DIRECT: &str = "direct";
pub const ENGINE_BLOXROUTE: &str = "bloxroute";

/// Stable engine identifier, lower-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineKey(String);

impl EngineKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// JSON-RPC method an engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMethod {
    /// `sendBundle` with the whole set
    #[default]
    Bundle,
    /// `sendTransaction`, single-transaction sets only
    Transaction,
}

impl SubmitMethod {
    pub fn rpc_method(&self) -> &'static str {
        match self {
            SubmitMethod::Bundle => "sendBundle",
            SubmitMethod::Transaction => "sendTransaction",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "bundle" | "sendbundle" => Some(SubmitMethod::Bundle),
            "transaction" | "tx" | "sendtransaction" => Some(SubmitMethod::Transaction),
            _ => None,
        }
    }
}

/// Client certificate for mutual TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A configured relay service
#[derive(Debug, Clone)]
pub struct Engine {
    pub key: EngineKey,
    pub label: String,
    pub endpoints: Vec<String>,
    pub headers: HeaderMap,
    pub tls: Option<ClientTlsConfig>,
    pub shuffle_endpoints: bool,
    pub dry_run: bool,
    pub method: SubmitMethod,
    /// Base URL for `GET {status_url}/{id}` landing lookups
    pub status_url: Option<String>,
}

impl Engine {
    pub fn from_settings(
        settings: &EngineSettings,
        global_shuffle: bool,
        global_dry_run: bool,
    ) -> Result<Self, ConfigError> {
        let key = EngineKey::new(&settings.key);
        let mut headers = HeaderMap::new();

        if let Some(token) = &settings.auth_bearer {
            headers.insert(AUTHORIZATION, header_value(&key, &format!("Bearer {}", token))?);
        }
        if let Some(api_key) = &settings.api_key {
            let name = HeaderName::from_bytes(settings.api_key_header.as_bytes()).map_err(|e| {
                ConfigError::InvalidValue {
                    key: format!("RELAY_{}_API_KEY_HEADER", key.as_str().to_uppercase()),
                    reason: e.to_string(),
                }
            })?;
            headers.insert(name, header_value(&key, api_key)?);
        }
        if let Some(basic) = &settings.basic_auth {
            let encoded = BASE64_STANDARD.encode(basic.as_bytes());
            headers.insert(AUTHORIZATION, header_value(&key, &format!("Basic {}", encoded))?);
        }

        let tls = match (&settings.tls_cert, &settings.tls_key) {
            (Some(cert), Some(k)) => Some(ClientTlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(k),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: format!("RELAY_{}_TLS_CERT", key.as_str().to_uppercase()),
                    reason: "client certificate and key must be configured together".into(),
                })
            }
        };

        Ok(Self {
            label: settings.label.clone().unwrap_or_else(|| key.to_string()),
            endpoints: normalize_endpoints(&settings.endpoints),
            status_url: settings.status_url.as_deref().and_then(normalize_endpoint),
            headers,
            tls,
            shuffle_endpoints: settings.shuffle.unwrap_or(global_shuffle),
            dry_run: global_dry_run || settings.dry_run.unwrap_or(false),
            method: settings.method,
            key,
        })
    }

    pub fn has_endpoints(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

fn header_value(key: &EngineKey, raw: &str) -> Result<HeaderValue, ConfigError> {
    let mut value = HeaderValue::from_str(raw).map_err(|e| ConfigError::InvalidValue {
        key: format!("RELAY_{}_AUTH", key.as_str().to_uppercase()),
        reason: e.to_string(),
    })?;
    value.set_sensitive(true);
    Ok(value)
}

/// Normalize a single URL: trim, add `https://` when no scheme, strip trailing slashes
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let stripped = with_scheme.trim_end_matches('/');
    if stripped.ends_with("://") {
        return None;
    }
    Some(stripped.to_string())
}

/// Normalize a list of URLs, dropping blanks and case-insensitive duplicates
pub fn normalize_endpoints<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|s| normalize_endpoint(s.as_ref()))
        .filter(|url| seen.insert(url.to_lowercase()))
        .collect()
}

/// Split a comma-separated endpoint list and normalize it
pub fn parse_endpoint_list(raw: &str) -> Vec<String> {
    let parts: Vec<&str> = raw.split(',').collect();
    normalize_endpoints(&parts)
}

/// All configured engines plus their priority order
#[derive(Debug)]
pub struct EngineRegistry {
    engines: HashMap<EngineKey, Arc<Engine>>,
    order: Vec<EngineKey>,
}

impl EngineRegistry {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let engines = config
            .engines
            .iter()
            .map(|s| Engine::from_settings(s, config.shuffle_endpoints, config.dry_run))
            .collect::<Result<Vec<_>, _>>()?;
        let fallback = [
            EngineKey::new(&config.default_engine),
            EngineKey::new(ENGINE_DIRECT),
            EngineKey::new(ENGINE_BLOXROUTE),
        ];
        let explicit = config
            .engine_order
            .as_ref()
            .map(|keys| keys.iter().map(EngineKey::new).collect::<Vec<_>>());
        Ok(Self::new(engines, explicit.as_deref().unwrap_or(&fallback)))
    }

    /// Build a registry; `preferred` keys missing from `engines` or without endpoints are dropped
    pub fn new(engines: Vec<Engine>, preferred: &[EngineKey]) -> Self {
        let engines: HashMap<EngineKey, Arc<Engine>> = engines
            .into_iter()
            .map(|e| (e.key.clone(), Arc::new(e)))
            .collect();

        let mut seen = HashSet::new();
        let order: Vec<EngineKey> = preferred
            .iter()
            .filter(|k| seen.insert((*k).clone()))
            .filter(|k| match engines.get(*k) {
                Some(engine) if engine.has_endpoints() => true,
                Some(_) => {
                    debug!(engine = %k, "engine has no endpoints, excluded from order");
                    false
                }
                None => false,
            })
            .cloned()
            .collect();

        if order.is_empty() {
            warn!("no engine in the priority order has endpoints configured");
        }

        Self { engines, order }
    }

    pub fn get(&self, key: &EngineKey) -> Option<Arc<Engine>> {
        self.engines.get(key).cloned()
    }

    pub fn order(&self) -> &[EngineKey] {
        &self.order
    }

    pub fn engines(&self) -> impl Iterator<Item = &Arc<Engine>> {
        self.engines.values()
    }

    /// Engines in priority order; `explicit` overrides the configured order
    pub fn ordered(&self, explicit: Option<&[EngineKey]>) -> Vec<Arc<Engine>> {
        let keys = explicit.unwrap_or(&self.order);
        let mut seen = HashSet::new();
        keys.iter()
            .filter(|k| seen.insert((*k).clone()))
            .filter_map(|k| self.engines.get(k))
            .filter(|e| e.has_endpoints())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
