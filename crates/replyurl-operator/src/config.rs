//! CRD and configuration types

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Client secret location for the app registration used to call Microsoft Graph.
///
/// Exactly one source must be given. The wire format matches the field the
/// tag names: `envVarClientSecret: NAME` or `keyVaultClientSecret: {...}`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ClientSecretRef {
    /// Name of an environment variable holding the secret value
    EnvVarClientSecret(String),
    /// Secret stored in an Azure Key Vault
    KeyVaultClientSecret(KeyVaultSecretRef),
}

/// Reference to a secret stored in an Azure Key Vault
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyVaultSecretRef {
    /// Key Vault name (resolved to https://{name}.vault.azure.net)
    pub key_vault_name: String,
    /// Secret name within the vault
    pub secret_name: String,
}

/// ReplyURLSync spec - declares one app registration to keep in sync
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "appregistrations.replyurl.dev",
    version = "v1alpha1",
    kind = "ReplyURLSync",
    plural = "replyurlsyncs",
    shortname = "ruls",
    namespaced = true,
    status = "ReplyURLSyncStatus",
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".spec.ingressClassFilter"}"#,
    printcolumn = r#"{"name":"ObjectID", "type":"string", "jsonPath":".spec.objectID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplyURLSyncSpec {
    /// Azure AD tenant of the app registration
    #[serde(rename = "tenantID")]
    pub tenant_id: Option<String>,
    /// Client ID used to authenticate against Microsoft Graph
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    /// Object ID of the app registration whose reply URLs are managed
    #[serde(rename = "objectID")]
    pub object_id: Option<String>,
    /// Where to find the client secret
    pub client_secret: ClientSecretRef,
    /// Regex selecting which ingress hosts are managed.
    /// Matched unanchored, so `sandbox` also matches `notsandbox.example.com`;
    /// anchor the pattern (`^...$`) when an exact match is intended.
    /// Defaults to matching everything.
    pub domain_filter: Option<String>,
    /// Only ingresses of this class are considered (exact match)
    pub ingress_class_filter: Option<String>,
    /// Regex protecting stored reply URLs from removal: when set, a URL with
    /// no corresponding ingress host is only removed if it matches.
    /// Matched unanchored, same caveat as `domainFilter`.
    #[serde(rename = "replyURLFilter")]
    pub reply_url_filter: Option<String>,
    /// Path appended to `https://{host}` when formatting a reply URL.
    /// Defaults to `/oauth-proxy/callback`; set to `""` for host-only URLs.
    pub callback_path: Option<String>,
}

impl ReplyURLSyncSpec {
    /// Domain filter pattern, defaulting to match-everything
    pub fn domain_filter(&self) -> &str {
        self.domain_filter.as_deref().unwrap_or(defaults::DOMAIN_FILTER)
    }

    /// Callback path appended to formatted reply URLs
    pub fn callback_path(&self) -> &str {
        self.callback_path
            .as_deref()
            .unwrap_or(defaults::CALLBACK_PATH)
    }
}

/// ReplyURLSync status
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplyURLSyncStatus {
    /// Reply URLs the app registration held after the last successful pass
    #[serde(default)]
    pub synced_hosts: Vec<String>,
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Synced")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    pub fn synced(success: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Synced".to_string(),
            status: if success { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub fn degraded(reason: &str, message: &str) -> Self {
        Self {
            type_: "Degraded".to_string(),
            status: "True".to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Annotations recognized by the operator
pub mod annotations {
    /// Legacy ingress class annotation, used when spec.ingressClassName is unset
    pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
}

/// Spec field defaults
pub mod defaults {
    /// Domain filter applied when the spec leaves it unset
    pub const DOMAIN_FILTER: &str = ".*";
    /// Callback path appended to reply URLs
    pub const CALLBACK_PATH: &str = "/oauth-proxy/callback";
}
