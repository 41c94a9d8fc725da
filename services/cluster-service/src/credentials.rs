//! Short-lived virtual cluster credentials.
//!
//! A credential is the virtual cluster's API server endpoint and CA, read
//! from the kubeconfig secret the provider writes into the host namespace,
//! plus a token minted inside the virtual cluster for a dedicated identity.
//! The identity, its cluster role and binding are created on first use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::control_plane::{AccessGrant, ClusterConnector, ControlPlane, ControlPlaneError};
use crate::descriptor::namespace_for;

/// Shortest token lifetime handed out.
pub const MIN_LIFETIME_SECONDS: i64 = 600;

/// Audiences every issued token is valid for.
pub const TOKEN_AUDIENCES: [&str; 2] = ["https://kubernetes.default.svc.cluster.local", "k3s"];

/// Key of the kubeconfig inside the provider's secret.
pub const KUBECONFIG_SECRET_KEY: &str = "value";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid token lifetime {0:?}")]
    InvalidLifetime(String),

    #[error("token lifetime of {seconds}s is below the minimum of 600s")]
    LifetimeTooShort { seconds: i64 },

    #[error("kubeconfig secret {namespace}/{secret} not found")]
    KubeconfigMissing { namespace: String, secret: String },

    #[error("invalid virtual cluster kubeconfig: {0}")]
    InvalidKubeconfig(String),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Requested token lifetime: integer seconds or a compact duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lifetime {
    Seconds(i64),
    Duration(String),
}

impl Lifetime {
    /// Lifetime in seconds, at least [`MIN_LIFETIME_SECONDS`].
    pub fn seconds(&self) -> Result<i64, CredentialError> {
        let seconds = match self {
            Self::Seconds(s) => *s,
            Self::Duration(text) => parse_duration(text)?,
        };
        if seconds < MIN_LIFETIME_SECONDS {
            return Err(CredentialError::LifetimeTooShort { seconds });
        }
        Ok(seconds)
    }
}

/// Parse `"1h20m"`, `"45m"`, `"30s"` or `"3600"` into seconds.
///
/// Units may appear in any combination of `h`, `m` and `s`, each at most
/// once and in that order.
pub fn parse_duration(text: &str) -> Result<i64, CredentialError> {
    let invalid = || CredentialError::InvalidLifetime(text.to_string());
    let text_trimmed = text.trim();
    if text_trimmed.is_empty() {
        return Err(invalid());
    }
    if let Ok(seconds) = text_trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut last_rank = 0;

    for c in text_trimmed.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let (rank, unit) = match c {
            'h' => (1, 3600),
            'm' => (2, 60),
            's' => (3, 1),
            _ => return Err(invalid()),
        };
        if digits.is_empty() || rank <= last_rank {
            return Err(invalid());
        }
        let value: i64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
        digits.clear();
        last_rank = rank;
    }

    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigDocument {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    #[serde(default)]
    cluster: Option<ClusterEntry>,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    #[serde(default)]
    server: Option<String>,
    #[serde(default, rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

/// API server endpoint and CA of a virtual cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub certificate_authority_data: String,
}

/// First server and first CA across the kubeconfig's clusters.
///
/// The two may come from different entries.
pub fn extract_endpoint(kubeconfig: &[u8]) -> Result<Endpoint, CredentialError> {
    let document: KubeconfigDocument = serde_yaml::from_slice(kubeconfig)
        .map_err(|e| CredentialError::InvalidKubeconfig(e.to_string()))?;
    let entries = || document.clusters.iter().filter_map(|c| c.cluster.as_ref());

    let server = entries()
        .find_map(|c| c.server.clone().filter(|s| !s.is_empty()))
        .ok_or_else(|| CredentialError::InvalidKubeconfig("no cluster server".to_string()))?;
    let certificate_authority_data = entries()
        .find_map(|c| c.certificate_authority_data.clone().filter(|s| !s.is_empty()))
        .ok_or_else(|| {
            CredentialError::InvalidKubeconfig("no certificate-authority-data".to_string())
        })?;

    Ok(Endpoint {
        server,
        certificate_authority_data,
    })
}

/// Credentials returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCredentials {
    pub cluster: String,
    #[serde(rename = "clusterCerts")]
    pub cluster_certs: String,
    pub token: String,
    pub server: String,
}

/// Mints credentials for virtual clusters.
#[derive(Clone)]
pub struct CredentialIssuer {
    connector: Arc<dyn ClusterConnector>,
}

impl CredentialIssuer {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self { connector }
    }

    /// Issue a token for virtual cluster `name` living on `host`.
    #[instrument(skip(self, host))]
    pub async fn issue(
        &self,
        host: &dyn ControlPlane,
        name: &str,
        lifetime: &Lifetime,
    ) -> Result<ClusterCredentials, CredentialError> {
        let seconds = lifetime.seconds()?;
        let namespace = namespace_for(name);
        let secret = format!("{name}-kubeconfig");

        let kubeconfig = host
            .read_secret_key(&namespace, &secret, KUBECONFIG_SECRET_KEY)
            .await?
            .ok_or_else(|| CredentialError::KubeconfigMissing {
                namespace: namespace.clone(),
                secret: secret.clone(),
            })?;
        let endpoint = extract_endpoint(&kubeconfig)?;
        debug!(server = %endpoint.server, "Read virtual cluster endpoint");

        let access = self.connector.virtual_cluster(&kubeconfig).await?;
        let grant = AccessGrant::for_cluster(name, seconds);

        if !access
            .service_account_exists(&grant.namespace, &grant.identity_name)
            .await?
        {
            access.create_access_grant(&grant).await?;
            info!(identity = %grant.identity_name, "Created access grant");
        }

        let token = access.request_token(&grant, &TOKEN_AUDIENCES).await?;
        info!(expiry_seconds = seconds, "Issued virtual cluster token");

        Ok(ClusterCredentials {
            cluster: name.to_string(),
            cluster_certs: endpoint.certificate_authority_data,
            token,
            server: endpoint.server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{kubeconfig_for, MockAccessControl, MockConnector, MockControlPlane};

    #[test]
    fn test_parse_compact_durations() {
        assert_eq!(parse_duration("1h20m").unwrap(), 4800);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert_eq!(parse_duration("45m").unwrap(), 2700);
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("1h0m30s").unwrap(), 3630);
        assert_eq!(parse_duration("3600").unwrap(), 3600);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", "h", "1x", "20m1h", "1h1h", "1h20", "-5m"] {
            assert!(parse_duration(text).is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn test_lifetime_minimum() {
        assert_eq!(Lifetime::Duration("10m".to_string()).seconds().unwrap(), 600);
        assert!(matches!(
            Lifetime::Duration("9m".to_string()).seconds(),
            Err(CredentialError::LifetimeTooShort { seconds: 540 })
        ));
        assert!(matches!(
            Lifetime::Seconds(599).seconds(),
            Err(CredentialError::LifetimeTooShort { .. })
        ));
    }

    #[test]
    fn test_lifetime_wire_forms() {
        let n: Lifetime = serde_json::from_str("3600").unwrap();
        assert_eq!(n, Lifetime::Seconds(3600));
        let s: Lifetime = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(s.seconds().unwrap(), 3600);
    }

    #[test]
    fn test_extract_endpoint_first_match() {
        let yaml = b"clusters:\n\
- name: a\n  cluster:\n    server: https://first:443\n\
- name: b\n  cluster:\n    server: https://second:443\n    certificate-authority-data: Q0E=\n";

        let endpoint = extract_endpoint(yaml).unwrap();
        assert_eq!(endpoint.server, "https://first:443");
        assert_eq!(endpoint.certificate_authority_data, "Q0E=");
    }

    #[test]
    fn test_extract_endpoint_requires_server() {
        assert!(matches!(
            extract_endpoint(b"clusters: []\n"),
            Err(CredentialError::InvalidKubeconfig(_))
        ));
        assert!(matches!(
            extract_endpoint(b": not yaml: ["),
            Err(CredentialError::InvalidKubeconfig(_))
        ));
    }

    fn setup() -> (Arc<MockControlPlane>, Arc<MockAccessControl>, CredentialIssuer) {
        let kubeconfig = kubeconfig_for("alpha", "https://alpha.eu-1.fleet.test");
        let host = Arc::new(MockControlPlane::new());
        host.add_namespace("alpha-vcluster");
        host.insert_secret("alpha-vcluster", "alpha-kubeconfig", "value", kubeconfig.as_bytes());

        let access = Arc::new(MockAccessControl::new());
        let connector = MockConnector::new().with_virtual_cluster(&kubeconfig, access.clone());
        (host, access, CredentialIssuer::new(Arc::new(connector)))
    }

    #[tokio::test]
    async fn test_issue_creates_grant_once() {
        let (host, access, issuer) = setup();

        let creds = issuer
            .issue(host.as_ref(), "alpha", &Lifetime::Duration("1h20m".to_string()))
            .await
            .unwrap();
        assert_eq!(creds.cluster, "alpha");
        assert_eq!(creds.server, "https://alpha.eu-1.fleet.test");
        assert_eq!(creds.cluster_certs, "bW9jay1jYQ==");
        assert_eq!(creds.token, "token-alpha-4800");

        issuer
            .issue(host.as_ref(), "alpha", &Lifetime::Seconds(900))
            .await
            .unwrap();

        assert_eq!(access.grants().len(), 1);
        let issued = access.issued();
        assert_eq!(issued.len(), 2);
        assert_eq!(
            issued[0].1,
            vec!["https://kubernetes.default.svc.cluster.local", "k3s"]
        );
        assert_eq!(issued[1].0.token_expiry_seconds, 900);
    }

    #[tokio::test]
    async fn test_issue_rejects_short_lifetime_before_any_call() {
        let (host, access, issuer) = setup();

        let err = issuer
            .issue(host.as_ref(), "alpha", &Lifetime::Seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::LifetimeTooShort { seconds: 60 }));
        assert!(host.calls().is_empty());
        assert!(access.issued().is_empty());
    }

    #[tokio::test]
    async fn test_issue_missing_secret() {
        let (host, _access, issuer) = setup();

        let err = issuer
            .issue(host.as_ref(), "beta", &Lifetime::Seconds(3600))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::KubeconfigMissing { ref secret, .. } if secret == "beta-kubeconfig"
        ));
    }

    #[test]
    fn test_credentials_wire_names() {
        let creds = ClusterCredentials {
            cluster: "alpha".to_string(),
            cluster_certs: "Q0E=".to_string(),
            token: "t".to_string(),
            server: "https://alpha".to_string(),
        };
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(json["clusterCerts"], "Q0E=");
        assert_eq!(json["server"], "https://alpha");
    }
}
