//! Host filtering and reply-URL formatting
//!
//! Turns ingress routing rules into the desired set of reply URLs for one
//! sync spec: class filter first, then domain regex, then formatting.

use k8s_openapi::api::networking::v1::Ingress;
use regex::Regex;

use crate::config::{annotations, ReplyURLSyncSpec};

/// One externally reachable hostname advertised by an ingress rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Hostname from the ingress rule
    pub host: String,
    /// Ingress class, from spec.ingressClassName or the legacy annotation.
    /// `None` means unclassified; such routes are never synced.
    pub route_class: Option<String>,
}

/// Ingress class of a resource: spec.ingressClassName wins, the
/// `kubernetes.io/ingress.class` annotation is the legacy fallback.
pub fn ingress_class_of(ingress: &Ingress) -> Option<String> {
    if let Some(spec) = &ingress.spec {
        if let Some(class) = &spec.ingress_class_name {
            if !class.is_empty() {
                return Some(class.clone());
            }
        }
    }

    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::INGRESS_CLASS))
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Extract route rules from an Ingress, one per non-empty rule host
pub fn route_rules_from_ingress(ingress: &Ingress) -> Vec<RouteRule> {
    let route_class = ingress_class_of(ingress);
    let mut routes = Vec::new();

    if let Some(spec) = &ingress.spec {
        if let Some(rules) = &spec.rules {
            for rule in rules {
                if let Some(host) = &rule.host {
                    if !host.is_empty() {
                        routes.push(RouteRule {
                            host: host.clone(),
                            route_class: route_class.clone(),
                        });
                    }
                }
            }
        }
    }

    routes
}

/// Format a host into a reply URL. An empty callback path yields
/// `https://{host}` for providers without a fixed callback suffix.
pub fn format_reply_url(host: &str, callback_path: &str) -> String {
    format!("https://{host}{callback_path}")
}

/// Compiled filter predicates for one sync spec
pub struct HostFilter {
    domain: Regex,
    route_class: Option<String>,
    callback_path: String,
}

impl HostFilter {
    /// Compile a filter. Fails on a malformed domain pattern.
    pub fn compile(
        domain_pattern: &str,
        route_class_filter: Option<&str>,
        callback_path: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            domain: Regex::new(domain_pattern)?,
            route_class: route_class_filter.map(str::to_string),
            callback_path: callback_path.to_string(),
        })
    }

    /// Compile the filter declared by a sync spec
    pub fn from_spec(spec: &ReplyURLSyncSpec) -> Result<Self, regex::Error> {
        Self::compile(
            spec.domain_filter(),
            spec.ingress_class_filter.as_deref(),
            spec.callback_path(),
        )
    }

    /// Whether a route passes both the class and domain predicates.
    ///
    /// Unclassified routes never pass. The domain match is unanchored, so the
    /// pattern may hit anywhere in the hostname.
    pub fn matches(&self, route: &RouteRule) -> bool {
        let class_ok = match (&self.route_class, &route.route_class) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(filter), Some(class)) => filter == class,
        };

        class_ok && self.domain.is_match(&route.host)
    }

    /// Desired reply URLs for the given routes, lazily evaluated
    pub fn desired_reply_urls<'a>(
        &'a self,
        routes: &'a [RouteRule],
    ) -> impl Iterator<Item = String> + 'a {
        routes
            .iter()
            .filter(|route| self.matches(route))
            .map(|route| format_reply_url(&route.host, &self.callback_path))
    }
}
