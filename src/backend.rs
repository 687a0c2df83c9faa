//! HTTP client for the remediation backend.
//!
//! The backend serves three things to the engine: the verification public
//! key, batch signature lookups and the sealed artifacts themselves.

use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::RemediationConfig;
use crate::model::{Artifact, ArtifactIdentifier, SignatureRecord};

const USER_AGENT: &str = concat!("package-sealer/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// Transport-level failure (connect, TLS, timeout, body read)
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-2xx status
    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    /// Response body could not be decoded
    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Failed to build http client: {0}")]
    Client(String),
}

/// Source of the verification key and of signature records.
#[async_trait]
pub trait SignatureBackend: Send + Sync {
    /// Returns the encoded (base64 or hex) Ed25519 public key.
    async fn public_key(&self) -> Result<String, BackendError>;

    /// Looks up signature records for every identifier in one call.
    async fn lookup_signatures(
        &self,
        artifacts: &[ArtifactIdentifier],
    ) -> Result<Vec<SignatureRecord>, BackendError>;
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Debug, Serialize)]
struct SignatureQuery<'a> {
    artifacts: &'a [ArtifactIdentifier],
}

#[derive(Clone, Debug)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl BackendClient {
    pub fn new(config: &RemediationConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Downloads an artifact. The file name comes from `Content-Disposition`
    /// when the server sends one, otherwise `default_name` is used.
    ///
    /// # Errors
    ///
    /// Any non-2xx status is reported as [`BackendError::Status`].
    #[instrument(skip(self))]
    pub async fn download(&self, path: &str, default_name: &str) -> Result<Artifact, BackendError> {
        let url = self.url(path);
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| default_name.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|source| BackendError::Transport {
                url: url.clone(),
                source,
            })?;

        debug!(file = %file_name, size = bytes.len(), "Artifact downloaded");
        Ok(Artifact {
            file_name,
            bytes: bytes.to_vec(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl SignatureBackend for BackendClient {
    async fn public_key(&self) -> Result<String, BackendError> {
        let url = self.url("authz/public-key");
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                url: url.clone(),
                source,
            })?;
        let body: PublicKeyResponse = Self::decode(&url, response).await?;
        Ok(body.public_key)
    }

    async fn lookup_signatures(
        &self,
        artifacts: &[ArtifactIdentifier],
    ) -> Result<Vec<SignatureRecord>, BackendError> {
        let url = self.url("authz/signatures");
        let response = self
            .authorize(self.http.post(&url))
            .json(&SignatureQuery { artifacts })
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                url: url.clone(),
                source,
            })?;
        Self::decode(&url, response).await
    }
}

/// Extracts `filename` from a `Content-Disposition` header value.
fn disposition_file_name(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty() && !name.contains('/') && !name.contains(".."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    fn client_for(server: &Server) -> BackendClient {
        let config = RemediationConfig {
            server_url: server.url_str("/"),
            token: Some("secret".to_string()),
            ..RemediationConfig::default()
        };
        BackendClient::new(&config).unwrap()
    }

    #[test]
    fn test_disposition_file_name() {
        assert_eq!(
            disposition_file_name("attachment; filename=\"a-1.0-py3-none-any.whl\""),
            Some("a-1.0-py3-none-any.whl".to_string())
        );
        assert_eq!(disposition_file_name("attachment"), None);
        assert_eq!(disposition_file_name("attachment; filename=../x"), None);
    }

    #[tokio::test]
    async fn test_download_uses_content_disposition() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/pypi/a/1.1/download"),
                request::headers(contains(key("authorization"))),
            ])
            .respond_with(
                status_code(200)
                    .insert_header("content-disposition", "attachment; filename=a-1.1.whl")
                    .body("payload"),
            ),
        );

        let artifact = client_for(&server)
            .download("pypi/a/1.1/download", "fallback.whl")
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "a-1.1.whl");
        assert_eq!(artifact.bytes, b"payload");
    }

    #[tokio::test]
    async fn test_download_non_success_status_fails() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/dpkg/b/2.0/amd64/b.deb"))
                .respond_with(status_code(404)),
        );

        let err = client_for(&server)
            .download("dpkg/b/2.0/amd64/b.deb", "b.deb")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_signature_lookup_posts_batch() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/authz/signatures"),
                request::body(json_decoded(eq(serde_json::json!({
                    "artifacts": [{"file_name": "a.whl", "library_version_id": "v1"}]
                })))),
            ])
            .respond_with(json_encoded(serde_json::json!([
                {"file_name": "a.whl", "library_version_id": "v1", "signature": "sig"}
            ]))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/authz/public-key"))
                .respond_with(json_encoded(serde_json::json!({"public_key": "key"}))),
        );

        let client = client_for(&server);
        let ids = vec![ArtifactIdentifier {
            file_name: "a.whl".to_string(),
            library_version_id: "v1".to_string(),
            arch: None,
        }];
        let records = client.lookup_signatures(&ids).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "sig");
        assert_eq!(client.public_key().await.unwrap(), "key");
    }
}
