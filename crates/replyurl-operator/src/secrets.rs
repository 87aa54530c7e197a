//! Client secret resolution
//!
//! Resolves the Graph client secret declared by a sync spec. Environment
//! variables are looked up directly and never fall through to the vault.
//! Key Vault access authenticates with managed identity (IMDS) first, then
//! the az CLI. Nothing is cached, so a rotated secret is picked up on the
//! next pass.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::{ClientSecretRef, KeyVaultSecretRef};

const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const VAULT_API_VERSION: &str = "7.4";

const IMDS_TIMEOUT: Duration = Duration::from_secs(3);
const VAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Secret material. Neither `Debug` nor error paths reveal the value.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret value. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("environment variable {0} is not set")]
    EnvVarNotFound(String),
    #[error("secret {secret} not found in vault {vault}")]
    VaultSecretNotFound { vault: String, secret: String },
    #[error("Key Vault authentication failed: {0}")]
    Auth(String),
    #[error("Key Vault transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Key Vault returned status {status} for secret {secret}")]
    Unexpected { status: u16, secret: String },
}

impl SecretError {
    /// Whether the referenced secret is missing, as opposed to unreachable
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SecretError::EnvVarNotFound(_) | SecretError::VaultSecretNotFound { .. }
        )
    }
}

/// Trait for resolving client secrets
///
/// Allows mocking in tests while keeping the concrete implementation for
/// production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve a secret reference to concrete secret material
    async fn resolve(&self, secret_ref: &ClientSecretRef) -> Result<SecretString, SecretError>;
}

/// Resolves secrets from the environment or an Azure Key Vault
pub struct AzureSecretResolver {
    http: reqwest::Client,
    imds_endpoint: String,
    vault_endpoint: Option<String>,
}

impl AzureSecretResolver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            imds_endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
            vault_endpoint: None,
        }
    }

    /// Override the IMDS and vault endpoints, e.g. for sovereign clouds
    /// where vaults do not live under vault.azure.net.
    pub fn with_endpoints(
        imds_endpoint: impl Into<String>,
        vault_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            imds_endpoint: imds_endpoint.into(),
            vault_endpoint: Some(vault_endpoint.into()),
        }
    }

    fn vault_secret_url(&self, vault_name: &str, secret_name: &str) -> String {
        match &self.vault_endpoint {
            Some(base) => format!("{base}/secrets/{secret_name}?api-version={VAULT_API_VERSION}"),
            None => format!(
                "https://{vault_name}.vault.azure.net/secrets/{secret_name}?api-version={VAULT_API_VERSION}"
            ),
        }
    }

    /// Bearer token for the vault, trying managed identity then the az CLI
    async fn vault_token(&self) -> Result<String, SecretError> {
        match self.managed_identity_token().await {
            Ok(token) => Ok(token),
            Err(err) => {
                debug!(error = %err, "Managed identity unavailable, trying az CLI");
                self.cli_token().await
            }
        }
    }

    async fn managed_identity_token(&self) -> Result<String, SecretError> {
        let response = self
            .http
            .get(&self.imds_endpoint)
            .query(&[
                ("api-version", IMDS_API_VERSION),
                ("resource", VAULT_RESOURCE),
            ])
            .header("Metadata", "true")
            .timeout(IMDS_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SecretError::Auth(format!(
                "IMDS returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn cli_token(&self) -> Result<String, SecretError> {
        let output = tokio::process::Command::new("az")
            .args(["account", "get-access-token", "--resource", VAULT_RESOURCE, "-o", "json"])
            .output()
            .await
            .map_err(|err| SecretError::Auth(format!("az CLI unavailable: {err}")))?;

        if !output.status.success() {
            return Err(SecretError::Auth(format!(
                "az CLI exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token: CliTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|err| SecretError::Auth(format!("unparseable az CLI token: {err}")))?;
        Ok(token.access_token)
    }

    async fn vault_secret(&self, reference: &KeyVaultSecretRef) -> Result<SecretString, SecretError> {
        let token = self.vault_token().await?;
        let url = self.vault_secret_url(&reference.key_vault_name, &reference.secret_name);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .timeout(VAULT_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let secret: VaultSecretResponse = response.json().await?;
                Ok(SecretString::new(secret.value))
            }
            StatusCode::NOT_FOUND => Err(SecretError::VaultSecretNotFound {
                vault: reference.key_vault_name.clone(),
                secret: reference.secret_name.clone(),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SecretError::Auth(format!(
                "Key Vault returned {}",
                response.status()
            ))),
            other => Err(SecretError::Unexpected {
                status: other.as_u16(),
                secret: reference.secret_name.clone(),
            }),
        }
    }
}

impl Default for AzureSecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretResolver for AzureSecretResolver {
    #[instrument(skip(self, secret_ref))]
    async fn resolve(&self, secret_ref: &ClientSecretRef) -> Result<SecretString, SecretError> {
        match secret_ref {
            ClientSecretRef::EnvVarClientSecret(name) => match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    debug!(variable = %name, "Resolved client secret from environment");
                    Ok(SecretString::new(value))
                }
                _ => Err(SecretError::EnvVarNotFound(name.clone())),
            },
            ClientSecretRef::KeyVaultClientSecret(reference) => {
                let secret = self.vault_secret(reference).await?;
                debug!(
                    vault = %reference.key_vault_name,
                    secret = %reference.secret_name,
                    "Resolved client secret from Key Vault"
                );
                Ok(secret)
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct CliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Deserialize)]
struct VaultSecretResponse {
    value: String,
}
