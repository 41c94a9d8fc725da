//! Host cluster credential stores.
//!
//! Every host cluster's kubeconfig is stored base64-encoded under the host
//! cluster id. Two stores are provided:
//! - Dapr secrets API: one secret holding a map keyed by host cluster id
//! - Static JSON file with the same map, for development

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("no kubeconfig stored for host cluster {0}")]
    Missing(String),

    #[error("secret store request failed: {0}")]
    Request(String),

    #[error("secret store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid secret payload: {0}")]
    Invalid(String),
}

/// Source of host cluster kubeconfigs.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Base64-encoded kubeconfig of a host cluster.
    async fn host_kubeconfig(&self, host_cluster_id: &str) -> Result<String, SecretStoreError>;
}

/// Decode a stored kubeconfig.
pub fn decode_kubeconfig(encoded: &str) -> Result<Vec<u8>, SecretStoreError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| SecretStoreError::Invalid(format!("kubeconfig is not base64: {e}")))
}

/// Where the Dapr secret lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaprSecretsConfig {
    /// Sidecar HTTP endpoint, e.g. `http://127.0.0.1:3500`.
    pub endpoint: String,
    /// Secret store component name.
    pub store: String,
    /// Secret holding the host cluster map.
    pub key: String,
    /// Optional `dapr-api-token`.
    pub api_token: Option<String>,
}

impl Default for DaprSecretsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3500".to_string(),
            store: "vault".to_string(),
            key: "dapr".to_string(),
            api_token: None,
        }
    }
}

/// Secret store backed by the Dapr sidecar's secrets API.
pub struct DaprSecretStore {
    client: reqwest::Client,
    config: DaprSecretsConfig,
}

impl DaprSecretStore {
    pub fn new(config: DaprSecretsConfig) -> Result<Self, SecretStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SecretStoreError::Request(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1.0/secrets/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.store,
            self.config.key
        )
    }
}

#[async_trait]
impl SecretStore for DaprSecretStore {
    async fn host_kubeconfig(&self, host_cluster_id: &str) -> Result<String, SecretStoreError> {
        let url = self.url();
        debug!(url = %url, host_cluster_id, "Fetching host cluster secret");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.api_token {
            request = request.header("dapr-api-token", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SecretStoreError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch host cluster secret");
            return Err(SecretStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut secrets: HashMap<String, String> = response
            .json()
            .await
            .map_err(|e| SecretStoreError::Invalid(e.to_string()))?;

        secrets
            .remove(host_cluster_id)
            .ok_or_else(|| SecretStoreError::Missing(host_cluster_id.to_string()))
    }
}

/// Secret store holding a fixed map, optionally loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Load `{"<host cluster id>": "<base64 kubeconfig>", ...}` from `path`.
    pub fn from_file(path: &Path) -> Result<Self, SecretStoreError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SecretStoreError::Request(format!("{}: {e}", path.display())))?;
        let secrets = serde_json::from_str(&contents)
            .map_err(|e| SecretStoreError::Invalid(format!("{}: {e}", path.display())))?;
        Ok(Self { secrets })
    }

    /// Store a plain kubeconfig under `host_cluster_id`.
    pub fn with_kubeconfig(mut self, host_cluster_id: &str, kubeconfig: &str) -> Self {
        self.secrets.insert(
            host_cluster_id.to_string(),
            base64::engine::general_purpose::STANDARD.encode(kubeconfig),
        );
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn host_kubeconfig(&self, host_cluster_id: &str) -> Result<String, SecretStoreError> {
        self.secrets
            .get(host_cluster_id)
            .cloned()
            .ok_or_else(|| SecretStoreError::Missing(host_cluster_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dapr_config(endpoint: String) -> DaprSecretsConfig {
        DaprSecretsConfig {
            endpoint,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dapr_store_returns_host_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/secrets/vault/dapr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "host-a": "a3ViZWNvbmZpZw==",
                "host-b": "b3RoZXI="
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = DaprSecretStore::new(dapr_config(server.uri())).unwrap();
        let encoded = store.host_kubeconfig("host-a").await.unwrap();

        assert_eq!(encoded, "a3ViZWNvbmZpZw==");
        assert_eq!(decode_kubeconfig(&encoded).unwrap(), b"kubeconfig");
    }

    #[tokio::test]
    async fn test_dapr_store_missing_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/secrets/vault/dapr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let store = DaprSecretStore::new(dapr_config(server.uri())).unwrap();
        let err = store.host_kubeconfig("host-x").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::Missing(id) if id == "host-x"));
    }

    #[tokio::test]
    async fn test_dapr_store_propagates_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("vault sealed"))
            .mount(&server)
            .await;

        let store = DaprSecretStore::new(dapr_config(server.uri())).unwrap();
        let err = store.host_kubeconfig("host-a").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_dapr_store_sends_api_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("dapr-api-token", "s3cret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"host-a": "eA=="})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = DaprSecretsConfig {
            api_token: Some("s3cret".to_string()),
            ..dapr_config(server.uri())
        };
        let store = DaprSecretStore::new(config).unwrap();
        assert_eq!(store.host_kubeconfig("host-a").await.unwrap(), "eA==");
    }

    #[tokio::test]
    async fn test_static_store_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"host-a": "eA=="}}"#).unwrap();

        let store = StaticSecretStore::from_file(file.path()).unwrap();
        assert_eq!(store.host_kubeconfig("host-a").await.unwrap(), "eA==");
        assert!(matches!(
            store.host_kubeconfig("host-b").await,
            Err(SecretStoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_static_store_with_kubeconfig() {
        let store = StaticSecretStore::default().with_kubeconfig("host-a", "apiVersion: v1");
        let encoded = store.host_kubeconfig("host-a").await.unwrap();
        assert_eq!(decode_kubeconfig(&encoded).unwrap(), b"apiVersion: v1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_kubeconfig("not base64!"),
            Err(SecretStoreError::Invalid(_))
        ));
    }
}
