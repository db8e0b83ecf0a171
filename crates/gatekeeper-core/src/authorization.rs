//! Plate authorization backends.
//!
//! Lookups never fail with `Err`: transport errors, timeouts, bad status
//! codes and malformed bodies all come back as `authorized = false` with the
//! reason in [`AuthorizationResult::error`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use plate_vision::clean_plate_text;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatekeeperError, GatekeeperResult};

/// Outcome of one registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub plate: String,
    pub authorized: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthorizationResult {
    pub fn decided(plate: &str, authorized: bool, latency_ms: u64) -> Self {
        Self {
            plate: plate.to_string(),
            authorized,
            latency_ms,
            error: None,
        }
    }

    /// Fail-closed result carrying the reason.
    pub fn failed(plate: &str, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            plate: plate.to_string(),
            authorized: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Answers whether a plate may pass.
#[async_trait]
pub trait PlateAuthorizer: Send + Sync {
    async fn lookup(&self, plate: &str, timeout: Duration) -> AuthorizationResult;

    async fn is_authorized(&self, plate: &str, timeout: Duration) -> bool {
        self.lookup(plate, timeout).await.authorized
    }

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// HTTP registry
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CheckPlateReply {
    registered: bool,
}

/// Registry service answering `GET {base_url}/check_plate?plate=...`
/// with `{"registered": bool, ...}`.
pub struct HttpRegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>) -> GatekeeperResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gatekeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| GatekeeperError::Config(format!("HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn query(&self, plate: &str, timeout: Duration) -> Result<bool, String> {
        let response = self
            .client
            .get(format!("{}/check_plate", self.base_url))
            .query(&[("plate", plate)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    format!("registry timed out after {}ms", timeout.as_millis())
                } else {
                    format!("registry unreachable: {err}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("registry returned {status}"));
        }
        let reply: CheckPlateReply = response
            .json()
            .await
            .map_err(|err| format!("malformed registry reply: {err}"))?;
        Ok(reply.registered)
    }
}

#[async_trait]
impl PlateAuthorizer for HttpRegistryClient {
    async fn lookup(&self, plate: &str, timeout: Duration) -> AuthorizationResult {
        let start = Instant::now();
        let result = self.query(plate, timeout).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(plate = %plate, latency_ms, ok = result.is_ok(), "registry lookup");
        match result {
            Ok(registered) => AuthorizationResult::decided(plate, registered, latency_ms),
            Err(reason) => AuthorizationResult::failed(plate, latency_ms, reason),
        }
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

// ---------------------------------------------------------------------------
// Static allow-list
// ---------------------------------------------------------------------------

/// Fixed allow-list. Entries are normalized the same way OCR output is.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    plates: HashSet<String>,
}

impl StaticRegistry {
    pub fn new<I, S>(plates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            plates: plates
                .into_iter()
                .map(|p| clean_plate_text(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }
}

#[async_trait]
impl PlateAuthorizer for StaticRegistry {
    async fn lookup(&self, plate: &str, _timeout: Duration) -> AuthorizationResult {
        let authorized = self.plates.contains(&clean_plate_text(plate));
        AuthorizationResult::decided(plate, authorized, 0)
    }

    fn describe(&self) -> String {
        format!("static allow-list ({} plates)", self.plates.len())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn default_registry_url() -> String {
    "http://localhost:5000".to_string()
}

/// Authorization backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorizationConfig {
    Http {
        #[serde(default = "default_registry_url")]
        base_url: String,
    },
    Static {
        #[serde(default)]
        plates: Vec<String>,
    },
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        AuthorizationConfig::Http {
            base_url: default_registry_url(),
        }
    }
}

impl AuthorizationConfig {
    pub fn build(&self) -> GatekeeperResult<Arc<dyn PlateAuthorizer>> {
        Ok(match self {
            AuthorizationConfig::Http { base_url } => Arc::new(HttpRegistryClient::new(base_url.clone())?),
            AuthorizationConfig::Static { plates } => Arc::new(StaticRegistry::new(plates)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_registry_normalizes_entries() {
        let registry = StaticRegistry::new(["ab-123", " kl07 cd 4321 "]);
        assert_eq!(registry.len(), 2);
        assert!(registry.is_authorized("AB123", Duration::from_secs(1)).await);
        assert!(registry.is_authorized("KL07CD4321", Duration::from_secs(1)).await);
        assert!(!registry.is_authorized("ZZZ999", Duration::from_secs(1)).await);
    }

    #[test]
    fn test_failed_result_is_unauthorized() {
        let r = AuthorizationResult::failed("AB123", 3000, "registry timed out after 3000ms");
        assert!(!r.authorized);
        assert!(r.error.is_some());
    }

    #[test]
    fn test_config_tagged_json() {
        let cfg: AuthorizationConfig =
            serde_json::from_str(r#"{"type":"static","plates":["ABC123"]}"#).unwrap();
        assert_eq!(
            cfg,
            AuthorizationConfig::Static {
                plates: vec!["ABC123".to_string()]
            }
        );
        let http: AuthorizationConfig = serde_json::from_str(r#"{"type":"http"}"#).unwrap();
        assert_eq!(http, AuthorizationConfig::default());
    }

    #[test]
    fn test_http_client_trims_trailing_slash() {
        let client = HttpRegistryClient::new("http://registry.local:5000/").unwrap();
        assert_eq!(client.describe(), "http://registry.local:5000");
    }
}
