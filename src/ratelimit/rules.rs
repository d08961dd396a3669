//! Rate limit rules configuration and route matching.
//!
//! A policy document is an ordered list of route rules plus one default.
//! It is compiled once into a [`PolicyRegistry`], which is immutable and
//! replaced wholesale when the document is reloaded.

use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::policy::{
    FailureMode, KeyStrategy, RateLimitPolicy, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MILLIS,
};
use crate::error::{RatewardenError, Result};

/// A complete policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Policy for routes that no rule matches
    #[serde(default)]
    pub default: Option<PolicyEntry>,
    /// Route rules in insertion order
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// The limit part of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Length of the sliding window in milliseconds
    #[serde(default = "default_window_millis")]
    pub window_millis: u64,
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// How callers are told apart
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Behaviour while the store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Optional policy id; derived from the rule when absent
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        Self {
            window_millis: default_window_millis(),
            max_requests: default_max_requests(),
            key_strategy: KeyStrategy::default(),
            failure_mode: FailureMode::default(),
            name: None,
        }
    }
}

fn default_window_millis() -> u64 {
    DEFAULT_WINDOW_MILLIS
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

/// A route-scoped rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route prefix, matched on path-segment boundaries
    pub route: String,
    /// Optional HTTP method; a rule without one matches every method
    #[serde(default)]
    pub method: Option<String>,
    #[serde(flatten)]
    pub policy: PolicyEntry,
}

impl PolicyDocument {
    /// Load a policy document from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// A compiled route rule.
#[derive(Debug)]
struct CompiledRoute {
    pattern: String,
    method: Option<Method>,
    policy: Arc<RateLimitPolicy>,
}

impl CompiledRoute {
    fn matches(&self, route: &str, method: &Method) -> bool {
        let method_matches = match &self.method {
            Some(m) => m == method,
            None => true,
        };
        method_matches && prefix_matches(&self.pattern, route)
    }
}

/// Read-only table from route to policy.
#[derive(Debug)]
pub struct PolicyRegistry {
    /// Longest pattern first, method-specific before method-less, then
    /// insertion order.
    routes: Vec<CompiledRoute>,
    default: Arc<RateLimitPolicy>,
}

impl PolicyRegistry {
    /// Compile a policy document, validating every entry.
    pub fn from_document(document: &PolicyDocument) -> Result<Self> {
        let default = match &document.default {
            Some(entry) => build_policy(entry, "default")?,
            None => RateLimitPolicy::fallback(),
        };

        let mut seen_rules = HashSet::new();
        let mut seen_ids = HashSet::new();
        seen_ids.insert(default.id().to_string());

        let mut routes = Vec::with_capacity(document.routes.len());
        for rule in &document.routes {
            let pattern = normalize_pattern(&rule.route)?;
            let method = rule.method.as_deref().map(parse_method).transpose()?;

            let rule_label = format!(
                "{} {}",
                method.as_ref().map(Method::as_str).unwrap_or("*"),
                pattern
            );
            if !seen_rules.insert((pattern.clone(), method.clone())) {
                return Err(RatewardenError::Config(format!(
                    "duplicate rule for '{}'",
                    rule_label
                )));
            }

            let policy = build_policy(&rule.policy, &rule_label)?;
            if !seen_ids.insert(policy.id().to_string()) {
                return Err(RatewardenError::Config(format!(
                    "policy id '{}' is used by more than one rule",
                    policy.id()
                )));
            }

            debug!(rule = %rule_label, policy = %policy, "Compiled rate limit rule");
            routes.push(CompiledRoute {
                pattern,
                method,
                policy: Arc::new(policy),
            });
        }

        // Stable sort keeps insertion order among equal keys.
        routes.sort_by_key(|r| (std::cmp::Reverse(r.pattern.len()), r.method.is_none()));

        Ok(Self {
            routes,
            default: Arc::new(default),
        })
    }

    /// Registry holding only the built-in default policy.
    pub fn with_defaults() -> Self {
        Self {
            routes: Vec::new(),
            default: Arc::new(RateLimitPolicy::fallback()),
        }
    }

    /// Find the policy governing a route and method.
    ///
    /// Always returns the same `Arc` for the same inputs.
    pub fn match_route(&self, route: &str, method: &Method) -> Arc<RateLimitPolicy> {
        self.routes
            .iter()
            .find(|r| r.matches(route, method))
            .map(|r| Arc::clone(&r.policy))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// The policy applied to unmatched routes.
    pub fn default_policy(&self) -> &Arc<RateLimitPolicy> {
        &self.default
    }

    /// Rules in match order, as `(pattern, method, policy)`.
    pub fn rules(&self) -> impl Iterator<Item = (&str, Option<&Method>, &Arc<RateLimitPolicy>)> {
        self.routes
            .iter()
            .map(|r| (r.pattern.as_str(), r.method.as_ref(), &r.policy))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn build_policy(entry: &PolicyEntry, fallback_id: &str) -> Result<RateLimitPolicy> {
    let id = entry.name.clone().unwrap_or_else(|| fallback_id.to_string());
    RateLimitPolicy::new(
        id,
        entry.window_millis,
        entry.max_requests,
        entry.key_strategy,
        entry.failure_mode,
    )
}

fn normalize_pattern(route: &str) -> Result<String> {
    let route = route.trim();
    if !route.starts_with('/') {
        return Err(RatewardenError::Config(format!(
            "route '{}' must start with '/'",
            route
        )));
    }
    let trimmed = route.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

fn parse_method(method: &str) -> Result<Method> {
    let upper = method.trim().to_ascii_uppercase();
    let parsed = match upper.as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" => Method::PATCH,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        "CONNECT" => Method::CONNECT,
        "TRACE" => Method::TRACE,
        _ => {
            return Err(RatewardenError::Config(format!(
                "unknown HTTP method '{}'",
                method
            )))
        }
    };
    Ok(parsed)
}

/// Prefix match on path-segment boundaries.
fn prefix_matches(pattern: &str, route: &str) -> bool {
    if pattern == "/" {
        return true;
    }
    match route.strip_prefix(pattern) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(yaml: &str) -> PolicyRegistry {
        let document = PolicyDocument::from_yaml(yaml).unwrap();
        PolicyRegistry::from_document(&document).unwrap()
    }

    #[test]
    fn test_parse_document() {
        let yaml = r#"
default:
  window_millis: 30000
  max_requests: 50
routes:
  - route: /api/login
    method: POST
    window_millis: 60000
    max_requests: 5
    key_strategy: ip
    failure_mode: closed
    name: login
"#;
        let document = PolicyDocument::from_yaml(yaml).unwrap();
        assert_eq!(document.routes.len(), 1);
        let rule = &document.routes[0];
        assert_eq!(rule.route, "/api/login");
        assert_eq!(rule.method.as_deref(), Some("POST"));
        assert_eq!(rule.policy.max_requests, 5);
        assert_eq!(rule.policy.failure_mode, FailureMode::Closed);
        assert_eq!(rule.policy.name.as_deref(), Some("login"));
    }

    #[test]
    fn test_unmatched_route_gets_default() {
        let registry = registry(
            r#"
default:
  window_millis: 30000
  max_requests: 50
routes:
  - route: /api
    max_requests: 10
"#,
        );
        let policy = registry.match_route("/health", &Method::GET);
        assert_eq!(policy.id(), "default");
        assert_eq!(policy.max_requests(), 50);
        assert_eq!(policy.window_millis(), 30000);
    }

    #[test]
    fn test_builtin_default_when_document_has_none() {
        let registry = registry("routes: []");
        let policy = registry.match_route("/anything", &Method::GET);
        assert_eq!(policy.max_requests(), DEFAULT_MAX_REQUESTS);
        assert_eq!(policy.window_millis(), DEFAULT_WINDOW_MILLIS);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = registry(
            r#"
routes:
  - route: /api
    max_requests: 100
  - route: /api/users
    max_requests: 10
  - route: /api/users/admin
    max_requests: 1
"#,
        );
        assert_eq!(registry.match_route("/api/orders", &Method::GET).max_requests(), 100);
        assert_eq!(registry.match_route("/api/users/42", &Method::GET).max_requests(), 10);
        assert_eq!(registry.match_route("/api/users/admin/x", &Method::GET).max_requests(), 1);
    }

    #[test]
    fn test_prefix_respects_segment_boundaries() {
        let registry = registry(
            r#"
routes:
  - route: /api/
    max_requests: 7
"#,
        );
        assert_eq!(registry.match_route("/api", &Method::GET).max_requests(), 7);
        assert_eq!(registry.match_route("/api/x", &Method::GET).max_requests(), 7);
        assert_eq!(registry.match_route("/apix", &Method::GET).id(), "default");
    }

    #[test]
    fn test_method_specific_rule_beats_method_less() {
        let registry = registry(
            r#"
routes:
  - route: /api/login
    max_requests: 100
  - route: /api/login
    method: post
    max_requests: 5
"#,
        );
        assert_eq!(registry.match_route("/api/login", &Method::POST).max_requests(), 5);
        assert_eq!(registry.match_route("/api/login", &Method::GET).max_requests(), 100);
    }

    #[test]
    fn test_longer_prefix_beats_method_match() {
        let registry = registry(
            r#"
routes:
  - route: /api
    method: GET
    max_requests: 100
  - route: /api/search
    max_requests: 20
"#,
        );
        assert_eq!(registry.match_route("/api/search", &Method::GET).max_requests(), 20);
    }

    #[test]
    fn test_equal_rank_rules_keep_declaration_order() {
        // Same pattern length, both method-less: listed as declared.
        let registry = registry(
            r#"
routes:
  - route: /a/b
    max_requests: 1
    name: first
  - route: /a/c
    max_requests: 2
    name: second
"#,
        );
        let ids: Vec<&str> = registry.rules().map(|(_, _, p)| p.id()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_match_is_idempotent() {
        let registry = registry(
            r#"
routes:
  - route: /api
    max_requests: 10
"#,
        );
        let first = registry.match_route("/api/x", &Method::GET);
        let second = registry.match_route("/api/x", &Method::GET);
        assert!(Arc::ptr_eq(&first, &second));

        let d1 = registry.match_route("/other", &Method::GET);
        let d2 = registry.match_route("/other", &Method::GET);
        assert!(Arc::ptr_eq(&d1, &d2));
    }

    #[test]
    fn test_zero_max_requests_is_config_error() {
        let document = PolicyDocument::from_yaml(
            r#"
routes:
  - route: /api
    max_requests: 0
"#,
        )
        .unwrap();
        let result = PolicyRegistry::from_document(&document);
        assert!(matches!(result, Err(RatewardenError::Config(_))));
    }

    #[test]
    fn test_zero_window_in_default_is_config_error() {
        let document = PolicyDocument::from_yaml(
            r#"
default:
  window_millis: 0
  max_requests: 10
"#,
        )
        .unwrap();
        assert!(PolicyRegistry::from_document(&document).is_err());
    }

    #[test]
    fn test_negative_values_fail_to_parse() {
        let result = PolicyDocument::from_yaml(
            r#"
routes:
  - route: /api
    max_requests: -1
"#,
        );
        assert!(matches!(result, Err(RatewardenError::Yaml(_))));
    }

    #[test]
    fn test_duplicate_rule_is_config_error() {
        let document = PolicyDocument::from_yaml(
            r#"
routes:
  - route: /api
    method: GET
  - route: /api/
    method: get
"#,
        )
        .unwrap();
        assert!(matches!(
            PolicyRegistry::from_document(&document),
            Err(RatewardenError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_policy_name_is_config_error() {
        let document = PolicyDocument::from_yaml(
            r#"
routes:
  - route: /a
    name: shared
  - route: /b
    name: shared
"#,
        )
        .unwrap();
        assert!(PolicyRegistry::from_document(&document).is_err());
    }

    #[test]
    fn test_unknown_method_and_relative_route_rejected() {
        let bad_method = PolicyDocument::from_yaml(
            r#"
routes:
  - route: /a
    method: FETCH
"#,
        )
        .unwrap();
        assert!(PolicyRegistry::from_document(&bad_method).is_err());

        let relative = PolicyDocument::from_yaml(
            r#"
routes:
  - route: api
"#,
        )
        .unwrap();
        assert!(PolicyRegistry::from_document(&relative).is_err());
    }

    #[test]
    fn test_derived_policy_ids() {
        let registry = registry(
            r#"
routes:
  - route: /api/login
    method: POST
  - route: /api
"#,
        );
        let ids: Vec<&str> = registry.rules().map(|(_, _, p)| p.id()).collect();
        assert_eq!(ids, vec!["POST /api/login", "* /api"]);
    }

    #[test]
    fn test_root_pattern_matches_everything() {
        let registry = registry(
            r#"
routes:
  - route: /
    max_requests: 3
"#,
        );
        assert_eq!(registry.match_route("/deep/path", &Method::PUT).max_requests(), 3);
    }
}
