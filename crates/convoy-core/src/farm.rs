//! External build farm client.
//!
//! The farm exposes one endpoint, `POST {base}/internal/enqueue`, which
//! accepts a build job and answers `200`/`202` with the job id and queue
//! position. Every request carries an idempotency key derived from the
//! release and commit, so a job the farm accepted just before a transport
//! error is deduplicated by the farm if it ever sees the request again.

use std::time::Duration;

use async_trait::async_trait;
use convoy_state::{BuildSpec, ProjectId, ReleaseId, ServiceId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{BuildMode, ControlPlaneConfig};
use crate::error::{BuildFarmError, ConvoyError, ConvoyResult};

/// A build job handed to the farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub release_id: ReleaseId,
    pub service_id: ServiceId,
    pub project_id: ProjectId,
    pub git_repo: String,
    pub git_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub build_config: BuildSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub priority: i32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub position: u32,
}

/// Hex SHA-256 of `"{release_id}:{git_sha}"`.
pub fn idempotency_key(release_id: &ReleaseId, git_sha: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(release_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(git_sha.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait BuildFarmClient: Send + Sync {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BuildFarmError>;
}

/// reqwest-backed [`BuildFarmClient`].
#[derive(Debug, Clone)]
pub struct HttpBuildFarmClient {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpBuildFarmClient {
    pub fn new(base_url: &str, timeout: Duration) -> ConvoyResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("convoy-core/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ConvoyError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            http_client,
        })
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    /// A client when `builds.mode = "farm"`, otherwise `None`.
    pub fn from_config(config: &ControlPlaneConfig) -> ConvoyResult<Option<Self>> {
        if config.builds.mode != BuildMode::Farm {
            return Ok(None);
        }
        let url = config.builds.farm_url.as_deref().ok_or_else(|| {
            ConvoyError::Config("builds.mode = \"farm\" requires builds.farm_url".to_string())
        })?;
        let mut client =
            Self::new(url, Duration::from_secs(config.builds.farm_timeout_secs))?;
        if let Some(key) = config.builds.farm_api_key.as_deref() {
            client = client.with_api_key(key);
        }
        Ok(Some(client))
    }

    pub fn enqueue_url(&self) -> String {
        format!("{}/internal/enqueue", self.base_url)
    }
}

#[async_trait]
impl BuildFarmClient for HttpBuildFarmClient {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BuildFarmError> {
        let mut req = self.http_client.post(self.enqueue_url()).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| BuildFarmError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(BuildFarmError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let accepted: EnqueueResponse = response
            .json()
            .await
            .map_err(|e| BuildFarmError::Decode(e.to_string()))?;
        debug!(job_id = %accepted.job_id, position = accepted.position, "build enqueued on farm");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_and_distinct() {
        let release = ReleaseId::from("rel-1");
        let a = idempotency_key(&release, "abc");
        assert_eq!(a, idempotency_key(&release, "abc"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, idempotency_key(&release, "abd"));
        assert_ne!(a, idempotency_key(&ReleaseId::from("rel-2"), "abc"));
    }

    #[test]
    fn enqueue_url_strips_trailing_slash() {
        let client = HttpBuildFarmClient::new("http://farm.internal/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.enqueue_url(), "http://farm.internal/internal/enqueue");
    }

    #[test]
    fn from_config_only_in_farm_mode() {
        let mut config = ControlPlaneConfig::default();
        assert!(HttpBuildFarmClient::from_config(&config).unwrap().is_none());

        config.builds.mode = BuildMode::Farm;
        assert!(HttpBuildFarmClient::from_config(&config).is_err());

        config.builds.farm_url = Some("http://farm".to_string());
        config.builds.farm_api_key = Some("secret".to_string());
        let client = HttpBuildFarmClient::from_config(&config).unwrap().unwrap();
        assert_eq!(client.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn request_omits_absent_optionals() {
        let req = EnqueueRequest {
            release_id: "r".into(),
            service_id: "api".into(),
            project_id: "shop".into(),
            git_repo: "https://git.example/shop/api".into(),
            git_sha: "abc".into(),
            git_branch: None,
            build_config: BuildSpec::default(),
            callback_url: None,
            priority: 0,
            idempotency_key: "k".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("git_branch").is_none());
        assert_eq!(json["build_config"]["context"], ".");
    }

    #[tokio::test]
    async fn unreachable_farm_is_a_transport_error() {
        // Reserve an ephemeral port, then close it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpBuildFarmClient::new(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(2),
        )
        .unwrap();
        let req = EnqueueRequest {
            release_id: "r".into(),
            service_id: "api".into(),
            project_id: "shop".into(),
            git_repo: String::new(),
            git_sha: "abc".into(),
            git_branch: None,
            build_config: BuildSpec::default(),
            callback_url: None,
            priority: 0,
            idempotency_key: idempotency_key(&"r".into(), "abc"),
        };
        let err = client.enqueue(&req).await.unwrap_err();
        assert!(matches!(err, BuildFarmError::Transport(_)));
    }
}
