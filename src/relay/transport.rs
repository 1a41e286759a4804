//! HTTP plumbing between the submitter/poller and relay services
//!
//! [`RelayTransport`] is the seam the rest of the relay layer talks through:
//! the production implementation is `reqwest`-backed, tests script responses
//! in memory.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{header::RETRY_AFTER, Client, Identity};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::classifier::{RelayFailure, RpcErrorObject};
use super::engine::{ClientTlsConfig, Engine, EngineKey, EngineRegistry};
use crate::config::ConfigError;

/// Raw reply from a status endpoint; any HTTP status is a reply, not a failure
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Option<Value>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// POST a JSON-RPC envelope and return the relay-assigned id from `result`
    async fn post_rpc(
        &self,
        engine: &Engine,
        endpoint: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<String, RelayFailure>;

    /// GET a status URL. `Err` only when no HTTP response was received.
    async fn get_json(&self, engine: &Engine, url: &str, timeout: Duration) -> Result<HttpReply, RelayFailure>;
}

/// `reqwest` transport; engines with a client certificate get their own client
pub struct HttpRelayTransport {
    default_client: Client,
    tls_clients: DashMap<EngineKey, Client>,
}

impl HttpRelayTransport {
    pub fn new() -> Result<Self, ConfigError> {
        let default_client = Client::builder()
            .build()
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        Ok(Self {
            default_client,
            tls_clients: DashMap::new(),
        })
    }

    /// Build the transport with mTLS clients for every engine that needs one
    pub fn for_registry(registry: &EngineRegistry) -> Result<Self, ConfigError> {
        let transport = Self::new()?;
        for engine in registry.engines() {
            if let Some(tls) = &engine.tls {
                let client = build_tls_client(tls)?;
                transport.tls_clients.insert(engine.key.clone(), client);
            }
        }
        Ok(transport)
    }

    fn client_for(&self, engine: &Engine) -> Client {
        self.tls_clients
            .get(&engine.key)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_client.clone())
    }
}

fn build_tls_client(tls: &ClientTlsConfig) -> Result<Client, ConfigError> {
    let mut pem = std::fs::read(&tls.cert_path).map_err(|e| ConfigError::InvalidValue {
        key: tls.cert_path.display().to_string(),
        reason: e.to_string(),
    })?;
    let key = std::fs::read(&tls.key_path).map_err(|e| ConfigError::InvalidValue {
        key: tls.key_path.display().to_string(),
        reason: e.to_string(),
    })?;
    pem.push(b'\n');
    pem.extend_from_slice(&key);
    let identity = Identity::from_pem(&pem).map_err(|e| ConfigError::Http(e.to_string()))?;
    Client::builder()
        .identity(identity)
        .build()
        .map_err(|e| ConfigError::Http(e.to_string()))
}

fn send_failure(endpoint: &str, err: reqwest::Error) -> RelayFailure {
    if err.is_timeout() {
        RelayFailure::no_response(format!("request to {} timed out", endpoint))
    } else {
        RelayFailure::no_response(format!("no response from {}: {}", endpoint, err))
    }
}

/// Pull the relay id out of a 2xx JSON-RPC body
pub fn parse_rpc_result(status: u16, text: &str) -> Result<String, RelayFailure> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayFailure::other(format!("malformed relay response: {}", e)))?;

    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let rpc_error = serde_json::from_value::<RpcErrorObject>(err.clone()).unwrap_or_else(|_| {
            RpcErrorObject {
                code: 0,
                message: err.to_string(),
                data: None,
            }
        });
        return Err(RelayFailure::rpc(status, rpc_error, Some(text.to_string())));
    }

    match value.get("result") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Object(obj)) => obj
            .get("bundle_id")
            .or_else(|| obj.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayFailure::other("relay result carries no identifier")),
        _ => Err(RelayFailure::other("relay response missing result")),
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn post_rpc(
        &self,
        engine: &Engine,
        endpoint: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<String, RelayFailure> {
        let response = self
            .client_for(engine)
            .post(endpoint)
            .headers(engine.headers.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| send_failure(endpoint, e))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| send_failure(endpoint, e))?;

        debug!(engine = %engine.key, endpoint = %endpoint, status = status, "Relay responded");

        if !(200..300).contains(&status) {
            let body = (!text.is_empty()).then_some(text);
            return Err(RelayFailure::http(status, body, retry_after));
        }
        parse_rpc_result(status, &text)
    }

    async fn get_json(&self, engine: &Engine, url: &str, timeout: Duration) -> Result<HttpReply, RelayFailure> {
        let response = self
            .client_for(engine)
            .get(url)
            .headers(engine.headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_failure(url, e))?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.ok();
        Ok(HttpReply { status, body })
    }
}
