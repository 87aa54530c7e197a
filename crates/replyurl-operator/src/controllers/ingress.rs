//! Ingress controller
//!
//! Watches networking.k8s.io/v1 Ingress resources and runs a targeted sync
//! pass for every ReplyURLSync spec matching the ingress class: new or
//! changed hosts are added to the app registration's reply URLs. Stale
//! entries are left for the sweeper, which sees all ingresses at once.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::filter::{ingress_class_of, route_rules_from_ingress};
use crate::graph::GraphError;
use crate::reconcile::{run_sync_pass, SyncError, SyncMode};

use super::retry::{compute_backoff, ErrorKind};
use super::{degraded_status, synced_status, update_sync_status, ControllerContext};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Reconcile a single Ingress resource
#[instrument(skip(ctx, ingress), fields(
    namespace = %ingress.metadata.namespace.as_deref().unwrap_or("default"),
    name = %ingress.metadata.name.as_deref().unwrap_or("unknown"),
))]
pub(crate) async fn reconcile(
    ingress: Arc<Ingress>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, IngressError> {
    // An ingress without a class cannot match any sync spec
    let class = match ingress_class_of(&ingress) {
        Some(class) => class,
        None => {
            debug!("Ingress has no class, skipping");
            return Ok(Action::await_change());
        }
    };

    let routes = route_rules_from_ingress(&ingress);
    if routes.is_empty() {
        debug!("No hosts found in Ingress spec");
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    let registry = ctx.specs.load().await?;
    let matching = registry.find_by_route_class(Some(&class));
    if matching.is_empty() {
        debug!(class = %class, "No ReplyURLSync specs for ingress class");
        return Ok(Action::await_change());
    }

    // One spec failing must not stop the others; the first error is kept
    // for the retry policy.
    let mut first_err: Option<SyncError> = None;

    for sync in matching {
        match run_sync_pass(
            ctx.graph.as_ref(),
            ctx.secrets.as_ref(),
            sync,
            &routes,
            SyncMode::Targeted,
        )
        .await
        {
            Ok(delta) => {
                if !delta.is_noop() {
                    info!(
                        sync = %sync.name_any(),
                        added = delta.added.len(),
                        "Reply URLs added for ingress"
                    );
                }
                update_sync_status(&ctx.kube_client, sync, synced_status(delta.synced_urls()))
                    .await?;
            }
            Err(err) => {
                warn!(sync = %sync.name_any(), error = %err, "Targeted sync failed");
                update_sync_status(&ctx.kube_client, sync, degraded_status(sync, &err)).await?;
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err.into());
    }

    // Reset retry counter on success
    if let Some(uid) = ingress.metadata.uid.as_deref() {
        ctx.retry_tracker.reset(uid);
    }

    // Requeue for periodic resync
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Classify error type for retry behavior
fn classify_error(error: &IngressError) -> ErrorKind {
    match error {
        IngressError::Kube(_) => ErrorKind::Transient,
        IngressError::Sync(sync_err) => match sync_err {
            // Spec problems won't resolve without an edit
            SyncError::MissingField { .. } | SyncError::InvalidFilter { .. } => {
                ErrorKind::Permanent
            }
            SyncError::Secret(secret_err) if secret_err.is_not_found() => ErrorKind::Permanent,
            SyncError::Secret(_) => ErrorKind::Transient,
            SyncError::Graph(GraphError::NotFound(_) | GraphError::Validation(_)) => {
                ErrorKind::Permanent
            }
            SyncError::Graph(_) => ErrorKind::Transient,
        },
    }
}

/// Error policy for the controller with exponential backoff
fn error_policy(ingress: Arc<Ingress>, error: &IngressError, ctx: Arc<ControllerContext>) -> Action {
    let uid = ingress.metadata.uid.as_deref().unwrap_or("unknown");
    let kind = classify_error(error);

    let attempt = ctx.retry_tracker.increment(uid);

    warn!(
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "Reconciliation error"
    );

    compute_backoff(attempt, kind)
}

/// Run the Ingress controller
pub async fn run(client: Client, ctx: Arc<ControllerContext>) {
    let ingresses: Api<Ingress> = Api::all(client.clone());

    info!("Starting Ingress controller");

    Controller::new(ingresses, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = ?e, "Ingress controller stream error");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretError;

    #[test]
    fn test_classify_error_transient() {
        let kube_err = IngressError::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }));
        assert!(matches!(classify_error(&kube_err), ErrorKind::Transient));

        let auth_err = IngressError::Sync(SyncError::Secret(SecretError::Auth(
            "token endpoint unreachable".to_string(),
        )));
        assert!(matches!(classify_error(&auth_err), ErrorKind::Transient));

        let graph_err = IngressError::Sync(SyncError::Graph(GraphError::Unexpected {
            status: 503,
            message: "service unavailable".to_string(),
        }));
        assert!(matches!(classify_error(&graph_err), ErrorKind::Transient));
    }

    #[test]
    fn test_classify_error_permanent() {
        let missing = IngressError::Sync(SyncError::MissingField {
            field: ".spec.objectID",
            resource: "ReplyURLSync./test".to_string(),
        });
        assert!(matches!(classify_error(&missing), ErrorKind::Permanent));

        let invalid = IngressError::Sync(SyncError::InvalidFilter {
            field: ".spec.domainFilter",
            pattern: "[invalid".to_string(),
            source: regex::Regex::new("[").unwrap_err(),
        });
        assert!(matches!(classify_error(&invalid), ErrorKind::Permanent));

        let secret = IngressError::Sync(SyncError::Secret(SecretError::EnvVarNotFound(
            "CLIENT_SECRET".to_string(),
        )));
        assert!(matches!(classify_error(&secret), ErrorKind::Permanent));

        let not_found = IngressError::Sync(SyncError::Graph(GraphError::NotFound(
            "object-id".to_string(),
        )));
        assert!(matches!(classify_error(&not_found), ErrorKind::Permanent));
    }

    // Reconcile function tests using mocks
    mod reconcile_tests {
        use super::*;
        use crate::config::{ClientSecretRef, ReplyURLSync, ReplyURLSyncSpec};
        use crate::graph::{AppRegistrationClient, MockAppRegistrationClient, MockGraphClientFactory};
        use crate::controllers::retry::RetryTracker;
        use crate::registry::{MockSyncSpecSource, SyncRegistry};
        use crate::secrets::{MockSecretResolver, SecretString};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        fn test_ingress(class: Option<&str>, host: &str, uid: &str) -> Ingress {
            Ingress {
                metadata: ObjectMeta {
                    name: Some("test-ingress".to_string()),
                    namespace: Some("default".to_string()),
                    uid: Some(uid.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::networking::v1::IngressSpec {
                    ingress_class_name: class.map(str::to_string),
                    rules: Some(vec![k8s_openapi::api::networking::v1::IngressRule {
                        host: Some(host.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                status: None,
            }
        }

        fn make_spec(object_id: &str, class: &str) -> ReplyURLSyncSpec {
            ReplyURLSyncSpec {
                tenant_id: Some("test-tenant".to_string()),
                client_id: Some("test-client".to_string()),
                object_id: Some(object_id.to_string()),
                client_secret: ClientSecretRef::EnvVarClientSecret("CLIENT_SECRET".to_string()),
                domain_filter: Some(r".*\.example\.com".to_string()),
                ingress_class_filter: Some(class.to_string()),
                reply_url_filter: None,
                callback_path: None,
            }
        }

        fn make_sync(name: &str, spec: ReplyURLSyncSpec) -> ReplyURLSync {
            ReplyURLSync::new(name, spec)
        }

        /// Mock service for creating a kube Client in tests. Answers status
        /// patches with a canned ReplyURLSync and rejects everything else.
        #[derive(Clone)]
        struct StatusOkService;

        impl tower::Service<http::Request<kube::client::Body>> for StatusOkService {
            type Response = http::Response<kube::client::Body>;
            type Error = std::convert::Infallible;
            type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

            fn poll_ready(
                &mut self,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), Self::Error>> {
                std::task::Poll::Ready(Ok(()))
            }

            fn call(&mut self, req: http::Request<kube::client::Body>) -> Self::Future {
                assert!(
                    req.uri().path().ends_with("/status"),
                    "unexpected kube API call: {}",
                    req.uri()
                );
                let sync = make_sync("test-sync", make_spec("test-object", "nginx"));
                let body = serde_json::to_vec(&sync).unwrap();
                let response = http::Response::builder()
                    .status(200)
                    .header("content-type", "application/json")
                    .body(kube::client::Body::from(body))
                    .unwrap();
                std::future::ready(Ok(response))
            }
        }

        fn mock_kube_client() -> Client {
            Client::new(StatusOkService, "default")
        }

        fn make_context(
            graph: MockGraphClientFactory,
            secrets: MockSecretResolver,
            specs: MockSyncSpecSource,
        ) -> Arc<ControllerContext> {
            Arc::new(ControllerContext {
                graph: Arc::new(graph),
                secrets: Arc::new(secrets),
                specs: Arc::new(specs),
                kube_client: mock_kube_client(),
                retry_tracker: Arc::new(RetryTracker::new()),
            })
        }

        fn specs_source(specs: Vec<ReplyURLSync>) -> MockSyncSpecSource {
            let mut source = MockSyncSpecSource::new();
            source
                .expect_load()
                .returning(move || Ok(SyncRegistry::new(specs.clone())));
            source
        }

        fn resolver_with_secret() -> MockSecretResolver {
            let mut secrets = MockSecretResolver::new();
            secrets
                .expect_resolve()
                .returning(|_| Ok(SecretString::new("resolved-secret")));
            secrets
        }

        fn factory_returning(client: MockAppRegistrationClient) -> MockGraphClientFactory {
            let client: Arc<dyn AppRegistrationClient> = Arc::new(client);
            let mut factory = MockGraphClientFactory::new();
            factory
                .expect_connect()
                .returning(move |_, _, _| Ok(client.clone()));
            factory
        }

        #[tokio::test]
        async fn test_reconcile_skips_unclassified_ingress() {
            let ingress = Arc::new(test_ingress(None, "app.example.com", "uid-1"));

            let ctx = make_context(
                MockGraphClientFactory::new(),
                MockSecretResolver::new(),
                MockSyncSpecSource::new(),
            );

            let result = reconcile(ingress, ctx).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_reconcile_no_specs_for_class() {
            let ingress = Arc::new(test_ingress(Some("nginx"), "app.example.com", "uid-1"));
            let specs = specs_source(vec![make_sync(
                "other-sync",
                make_spec("other-object", "traefik"),
            )]);

            let ctx = make_context(MockGraphClientFactory::new(), MockSecretResolver::new(), specs);

            let result = reconcile(ingress, ctx).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_reconcile_adds_host_to_matching_spec() {
            let ingress = Arc::new(test_ingress(Some("nginx"), "app.example.com", "uid-1"));
            let specs = specs_source(vec![make_sync("test-sync", make_spec("test-object", "nginx"))]);

            let mut client = MockAppRegistrationClient::new();
            client
                .expect_get_reply_urls()
                .times(1)
                .returning(|_| Ok(vec![]));
            client
                .expect_replace_reply_urls()
                .withf(|object_id, urls| {
                    object_id == "test-object"
                        && urls == &["https://app.example.com/oauth-proxy/callback".to_string()]
                })
                .times(1)
                .returning(|_, _| Ok(()));

            let ctx = make_context(factory_returning(client), resolver_with_secret(), specs);

            let result = reconcile(ingress, ctx).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_reconcile_applies_all_matching_specs() {
            let ingress = Arc::new(test_ingress(Some("nginx"), "app.example.com", "uid-1"));
            let specs = specs_source(vec![
                make_sync("sync-one", make_spec("object-one", "nginx")),
                make_sync("sync-two", make_spec("object-two", "nginx")),
            ]);

            let mut client = MockAppRegistrationClient::new();
            client
                .expect_get_reply_urls()
                .times(2)
                .returning(|_| Ok(vec![]));
            client
                .expect_replace_reply_urls()
                .withf(|object_id, _| object_id == "object-one" || object_id == "object-two")
                .times(2)
                .returning(|_, _| Ok(()));

            let ctx = make_context(factory_returning(client), resolver_with_secret(), specs);

            let result = reconcile(ingress, ctx).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_reconcile_continues_after_failing_spec() {
            let ingress = Arc::new(test_ingress(Some("nginx"), "app.example.com", "uid-1"));

            // First spec is missing its object ID, second is valid
            let mut broken = make_spec("unused", "nginx");
            broken.object_id = None;
            let specs = specs_source(vec![
                make_sync("broken-sync", broken),
                make_sync("good-sync", make_spec("good-object", "nginx")),
            ]);

            let mut client = MockAppRegistrationClient::new();
            client
                .expect_get_reply_urls()
                .times(1)
                .returning(|_| Ok(vec![]));
            client
                .expect_replace_reply_urls()
                .withf(|object_id, _| object_id == "good-object")
                .times(1)
                .returning(|_, _| Ok(()));

            let ctx = make_context(factory_returning(client), resolver_with_secret(), specs);

            let result = reconcile(ingress, ctx).await;

            // The valid spec was synced, but the broken one is reported
            let err = result.unwrap_err();
            assert!(matches!(
                err,
                IngressError::Sync(SyncError::MissingField { .. })
            ));
        }

        #[tokio::test]
        async fn test_reconcile_converged_spec_issues_no_write() {
            let ingress = Arc::new(test_ingress(Some("nginx"), "app.example.com", "uid-1"));
            let specs = specs_source(vec![make_sync("test-sync", make_spec("test-object", "nginx"))]);

            let mut client = MockAppRegistrationClient::new();
            client.expect_get_reply_urls().times(1).returning(|_| {
                Ok(vec![
                    "https://app.example.com/oauth-proxy/callback".to_string()
                ])
            });
            client.expect_replace_reply_urls().times(0);

            let ctx = make_context(factory_returning(client), resolver_with_secret(), specs);

            let result = reconcile(ingress, ctx).await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_reconcile_empty_ingress_requeues() {
            let mut ingress = test_ingress(Some("nginx"), "unused", "uid-1");
            if let Some(spec) = ingress.spec.as_mut() {
                spec.rules = Some(vec![]);
            }

            let ctx = make_context(
                MockGraphClientFactory::new(),
                MockSecretResolver::new(),
                MockSyncSpecSource::new(),
            );

            let result = reconcile(Arc::new(ingress), ctx).await;
            assert!(result.is_ok());
        }
    }
}
