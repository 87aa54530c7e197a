//! Microsoft Graph client for app registration reply URLs
//!
//! Wraps the two application operations the sync needs: read the stored
//! reply-URL list and replace it wholesale. A client is minted per pass via
//! [`GraphClientFactory`]; tokens are never reused across passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::secrets::SecretString;

const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const GRAPH_ENDPOINT: &str = "https://graph.microsoft.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph authentication failed: {0}")]
    Auth(String),
    #[error("application {0} not found")]
    NotFound(String),
    #[error("Graph rejected the request: {0}")]
    Validation(String),
    #[error("Graph returned status {status}: {message}")]
    Unexpected { status: u16, message: String },
    #[error("Graph transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Trait for reply-URL operations against one app registration
///
/// Allows mocking in tests while keeping the concrete implementation for
/// production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppRegistrationClient: Send + Sync {
    /// Fetch the currently stored reply URLs
    async fn get_reply_urls(&self, object_id: &str) -> Result<Vec<String>, GraphError>;

    /// Replace the entire reply-URL list
    async fn replace_reply_urls(
        &self,
        object_id: &str,
        reply_urls: Vec<String>,
    ) -> Result<(), GraphError>;
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: AppRegistrationClient + ?Sized> AppRegistrationClient for Arc<T> {
    async fn get_reply_urls(&self, object_id: &str) -> Result<Vec<String>, GraphError> {
        (**self).get_reply_urls(object_id).await
    }

    async fn replace_reply_urls(
        &self,
        object_id: &str,
        reply_urls: Vec<String>,
    ) -> Result<(), GraphError> {
        (**self).replace_reply_urls(object_id, reply_urls).await
    }
}

/// Mints an authenticated Graph client for one pass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphClientFactory: Send + Sync {
    /// Perform the client-credentials handshake and return a ready client
    async fn connect(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<Arc<dyn AppRegistrationClient>, GraphError>;
}

/// Client for the Microsoft Graph applications API
#[derive(Debug)]
pub struct GraphClient {
    http: reqwest::Client,
    graph_endpoint: String,
    token: SecretString,
}

impl GraphClient {
    /// Connect against the public Azure cloud endpoints
    pub async fn connect(
        tenant_id: &str,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<Self, GraphError> {
        Self::connect_with_endpoints(LOGIN_ENDPOINT, GRAPH_ENDPOINT, tenant_id, client_id, client_secret)
            .await
    }

    /// Connect with explicit login/Graph endpoints (sovereign clouds)
    pub async fn connect_with_endpoints(
        login_endpoint: &str,
        graph_endpoint: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<Self, GraphError> {
        let http = reqwest::Client::new();
        let token_url = format!("{login_endpoint}/{tenant_id}/oauth2/v2.0/token");

        let response = http
            .post(&token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret.expose()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_detail(response).await;
            return Err(GraphError::Auth(format!(
                "token request returned {status}: {message}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        debug!(tenant_id = %tenant_id, client_id = %client_id, "Acquired Graph access token");

        Ok(Self {
            http,
            graph_endpoint: graph_endpoint.to_string(),
            token: SecretString::new(token.access_token),
        })
    }

    fn application_url(&self, object_id: &str) -> String {
        format!("{}/v1.0/applications/{object_id}", self.graph_endpoint)
    }
}

#[async_trait]
impl AppRegistrationClient for GraphClient {
    #[instrument(skip(self))]
    async fn get_reply_urls(&self, object_id: &str) -> Result<Vec<String>, GraphError> {
        let url = format!("{}?$select=web", self.application_url(object_id));

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.token.expose())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        match status {
            status if status.is_success() => {
                let app: ApplicationResponse = response.json().await?;
                let urls = app.web.map(|web| web.redirect_uris).unwrap_or_default();
                debug!(object_id = %object_id, count = urls.len(), "Fetched reply URLs");
                Ok(urls)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GraphError::Auth(format!(
                "applications read returned {status}"
            ))),
            StatusCode::NOT_FOUND => Err(GraphError::NotFound(object_id.to_string())),
            _ => Err(GraphError::Unexpected {
                status: status.as_u16(),
                message: error_detail(response).await,
            }),
        }
    }

    #[instrument(skip(self, reply_urls), fields(count = reply_urls.len()))]
    async fn replace_reply_urls(
        &self,
        object_id: &str,
        reply_urls: Vec<String>,
    ) -> Result<(), GraphError> {
        let body = json!({ "web": { "redirectUris": reply_urls } });

        let response = self
            .http
            .patch(self.application_url(object_id))
            .bearer_auth(self.token.expose())
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        match status {
            status if status.is_success() => {
                debug!(object_id = %object_id, "Replaced reply URLs");
                Ok(())
            }
            StatusCode::BAD_REQUEST => Err(GraphError::Validation(error_detail(response).await)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GraphError::Auth(format!(
                "applications patch returned {status}"
            ))),
            StatusCode::NOT_FOUND => Err(GraphError::NotFound(object_id.to_string())),
            _ => Err(GraphError::Unexpected {
                status: status.as_u16(),
                message: error_detail(response).await,
            }),
        }
    }
}

/// Connects [`GraphClient`]s against fixed endpoints
pub struct AzureGraphClientFactory {
    login_endpoint: String,
    graph_endpoint: String,
}

impl AzureGraphClientFactory {
    pub fn new() -> Self {
        Self {
            login_endpoint: LOGIN_ENDPOINT.to_string(),
            graph_endpoint: GRAPH_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoints(
        login_endpoint: impl Into<String>,
        graph_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            login_endpoint: login_endpoint.into(),
            graph_endpoint: graph_endpoint.into(),
        }
    }
}

impl Default for AzureGraphClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphClientFactory for AzureGraphClientFactory {
    async fn connect(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<Arc<dyn AppRegistrationClient>, GraphError> {
        let client = GraphClient::connect_with_endpoints(
            &self.login_endpoint,
            &self.graph_endpoint,
            tenant_id,
            client_id,
            client_secret,
        )
        .await?;
        Ok(Arc::new(client))
    }
}

/// Best-effort error message from a Graph error body. Handles both the
/// applications API shape ({"error": {"message": ...}}) and the token
/// endpoint shape ({"error": "...", "error_description": ...}).
async fn error_detail(response: reqwest::Response) -> String {
    match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .or_else(|| body.get("error_description").and_then(|v| v.as_str()))
            .or_else(|| body.get("error").and_then(|v| v.as_str()))
            .unwrap_or("no error detail")
            .to_string(),
        Err(_) => "no error detail".to_string(),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ApplicationResponse {
    web: Option<WebSection>,
}

#[derive(Deserialize)]
struct WebSection {
    #[serde(rename = "redirectUris", default)]
    redirect_uris: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token_endpoint(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/test-tenant/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=test-client"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "test-token"})),
            )
            .mount(server)
            .await;
    }

    async fn test_client(server: &MockServer) -> GraphClient {
        GraphClient::connect_with_endpoints(
            &server.uri(),
            &server.uri(),
            "test-tenant",
            "test-client",
            &SecretString::new("test-secret"),
        )
        .await
        .expect("token handshake should succeed")
    }

    #[tokio::test]
    async fn test_get_reply_urls() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/applications/app-object-id"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {
                    "redirectUris": [
                        "https://a.example.com/oauth-proxy/callback",
                        "https://b.example.com/oauth-proxy/callback"
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let urls = client.get_reply_urls("app-object-id").await.unwrap();
        assert_eq!(
            urls,
            vec![
                "https://a.example.com/oauth-proxy/callback",
                "https://b.example.com/oauth-proxy/callback"
            ]
        );
    }

    #[tokio::test]
    async fn test_get_reply_urls_missing_web_section() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/applications/app-object-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let urls = client.get_reply_urls("app-object-id").await.unwrap();
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn test_replace_reply_urls_sends_whole_list() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("PATCH"))
            .and(path("/v1.0/applications/app-object-id"))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_json(serde_json::json!({
                "web": {"redirectUris": ["https://a.example.com/oauth-proxy/callback"]}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        client
            .replace_reply_urls(
                "app-object-id",
                vec!["https://a.example.com/oauth-proxy/callback".to_string()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_application_is_not_found() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/applications/missing-id"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client.get_reply_urls("missing-id").await.unwrap_err();
        assert!(matches!(err, GraphError::NotFound(ref id) if id == "missing-id"));
    }

    #[tokio::test]
    async fn test_replace_rejected_as_validation_error() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("PATCH"))
            .and(path("/v1.0/applications/app-object-id"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": "BadRequest", "message": "Too many redirect URIs"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client
            .replace_reply_urls("app-object-id", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(ref msg) if msg.contains("Too many")));
    }

    #[tokio::test]
    async fn test_token_rejection_does_not_leak_secret() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/test-tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided."
            })))
            .mount(&server)
            .await;

        let err = GraphClient::connect_with_endpoints(
            &server.uri(),
            &server.uri(),
            "test-tenant",
            "test-client",
            &SecretString::new("super-secret"),
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, GraphError::Auth(_)));
        assert!(message.contains("AADSTS7000215"));
        assert!(!message.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_forbidden_read_is_auth_error() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/applications/app-object-id"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client.get_reply_urls("app-object-id").await.unwrap_err();
        assert!(matches!(err, GraphError::Auth(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1.0/applications/app-object-id"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client.get_reply_urls("app-object-id").await.unwrap_err();
        assert!(matches!(err, GraphError::Unexpected { status: 503, .. }));
    }
}
