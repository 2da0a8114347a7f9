//! Compute Engine metadata server access
//!
//! Resolves the identity of the host instance once at startup, and hands out
//! service account access tokens to the Cloud Monitoring client.

use crate::error::{FatalError, PublishError};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Header every metadata request must carry
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

/// Identity of the instance the GPUs are attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub project_id: String,
    pub zone: String,
    pub instance_id: String,
}

/// OAuth token of the instance's default service account
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Lifetime in seconds from the moment it was issued
    pub expires_in: u64,
}

/// Thin client for the instance metadata endpoints
#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FatalError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FatalError::Config(format!("cannot build metadata HTTP client: {e}")))?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self { http, base_url })
    }

    /// Look up project, zone and instance id. Any failure here is fatal.
    pub async fn resolve_identity(&self) -> Result<HostIdentity, FatalError> {
        let zone_url = self.url("zone");
        let zone_path = self.get_text(&zone_url).await?;
        let (project_id, zone) =
            parse_zone_path(&zone_path).ok_or_else(|| FatalError::MetadataInvalid {
                url: zone_url.clone(),
                reason: format!("unexpected zone path {:?}", zone_path),
            })?;

        let id_url = self.url("id");
        let instance_id = self.get_text(&id_url).await?.trim().to_string();
        if instance_id.is_empty() {
            return Err(FatalError::MetadataInvalid {
                url: id_url,
                reason: "empty instance id".into(),
            });
        }

        info!(
            "Resolved host identity - project: {}, zone: {}, instance: {}",
            project_id, zone, instance_id
        );

        Ok(HostIdentity {
            project_id,
            zone,
            instance_id,
        })
    }

    /// Fetch a fresh token for the default service account
    pub async fn access_token(&self) -> Result<AccessToken, PublishError> {
        let url = self.url("service-accounts/default/token");
        debug!("Requesting access token from {}", url);

        let response = self
            .http
            .get(&url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .map_err(|e| PublishError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PublishError::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        response
            .json::<AccessToken>()
            .await
            .map_err(|e| PublishError::Auth(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_text(&self, url: &str) -> Result<String, FatalError> {
        let response = self
            .http
            .get(url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .map_err(|source| FatalError::MetadataUnreachable {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FatalError::MetadataInvalid {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        response
            .text()
            .await
            .map_err(|source| FatalError::MetadataUnreachable {
                url: url.to_string(),
                source,
            })
    }
}

/// Split `projects/<project>/zones/<zone>` into (project, zone)
pub fn parse_zone_path(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.trim().split('/').collect();
    if segments.len() < 4 {
        return None;
    }

    let project_id = segments[1];
    let zone = segments[3];
    if project_id.is_empty() || zone.is_empty() {
        return None;
    }

    Some((project_id.to_string(), zone.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zone_path() {
        assert_eq!(
            parse_zone_path("projects/123456789/zones/europe-west3-c"),
            Some(("123456789".to_string(), "europe-west3-c".to_string()))
        );
        assert_eq!(
            parse_zone_path("projects/42/zones/us-central1-a\n"),
            Some(("42".to_string(), "us-central1-a".to_string()))
        );
    }

    #[test]
    fn test_parse_zone_path_rejects_garbage() {
        assert_eq!(parse_zone_path("us-central1-a"), None);
        assert_eq!(parse_zone_path("projects//zones/us-central1-a"), None);
        assert_eq!(parse_zone_path("projects/42/zones"), None);
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = MetadataClient::new("http://metadata.internal/v1/instance", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("zone"), "http://metadata.internal/v1/instance/zone");
    }

    #[tokio::test]
    async fn test_unreachable_metadata_server_is_fatal() {
        // Nothing listens on port 1
        let client = MetadataClient::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        let err = client.resolve_identity().await.unwrap_err();

        assert!(matches!(err, FatalError::MetadataUnreachable { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_resolve_identity_from_metadata_server() {
        let mut server = mockito::Server::new_async().await;
        let zone = server
            .mock("GET", "/zone")
            .match_header("Metadata-Flavor", "Google")
            .with_status(200)
            .with_body("projects/123456789/zones/europe-west3-c")
            .create_async()
            .await;
        let id = server
            .mock("GET", "/id")
            .match_header("Metadata-Flavor", "Google")
            .with_status(200)
            .with_body("987654321")
            .create_async()
            .await;

        let client = MetadataClient::new(&server.url(), Duration::from_secs(2)).unwrap();
        let identity = client.resolve_identity().await.unwrap();

        assert_eq!(
            identity,
            HostIdentity {
                project_id: "123456789".into(),
                zone: "europe-west3-c".into(),
                instance_id: "987654321".into(),
            }
        );
        zone.assert_async().await;
        id.assert_async().await;
    }

    #[tokio::test]
    async fn test_metadata_error_status_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _zone = server
            .mock("GET", "/zone")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let client = MetadataClient::new(&server.url(), Duration::from_secs(2)).unwrap();
        let err = client.resolve_identity().await.unwrap_err();

        assert!(matches!(err, FatalError::MetadataInvalid { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_access_token_parsed() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", "/service-accounts/default/token")
            .match_header("Metadata-Flavor", "Google")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.token","expires_in":3599,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let client = MetadataClient::new(&server.url(), Duration::from_secs(2)).unwrap();
        let token = client.access_token().await.unwrap();

        assert_eq!(token.access_token, "ya29.token");
        assert_eq!(token.expires_in, 3599);
    }
}
