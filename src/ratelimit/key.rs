//! Rate limit key derivation.

use http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use super::policy::{KeyStrategy, RateLimitPolicy};

/// Discriminator used when no identity is attached to the request.
pub const ANONYMOUS: &str = "anonymous";
/// Discriminator used when neither forwarded-for nor the peer address is usable.
pub const UNKNOWN_IP: &str = "unknown";
/// Default namespace for keys in a shared store.
pub const DEFAULT_KEY_PREFIX: &str = "ratewarden:";

/// What the HTTP layer hands to the limiter for one inbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Route pattern as resolved by the router, e.g. `/users/:id`
    pub route: String,
    /// HTTP method
    #[serde(with = "method_serde", default = "default_method")]
    pub method: Method,
    /// Transport-level peer address
    #[serde(default)]
    pub peer_ip: Option<IpAddr>,
    /// Raw value of the forwarded-for header, if any
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Authenticated caller identity, if any
    #[serde(default)]
    pub identity: Option<String>,
}

impl AdmissionRequest {
    /// Create a request for a route with no caller information.
    pub fn new(route: impl Into<String>, method: Method) -> Self {
        Self {
            route: route.into(),
            method,
            peer_ip: None,
            forwarded_for: None,
            identity: None,
        }
    }

    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// The client IP: first forwarded-for hop if it parses, else the peer.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.forwarded_for
            .as_deref()
            .and_then(first_forwarded_hop)
            .or(self.peer_ip)
    }

    /// The identity, ignoring blank values.
    pub fn identity(&self) -> Option<&str> {
        self.identity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn default_method() -> Method {
    Method::GET
}

fn first_forwarded_hop(value: &str) -> Option<IpAddr> {
    let hop = value.split(',').next()?.trim();
    hop.parse().ok()
}

mod method_serde {
    use http::Method;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(D::Error::custom)
    }
}

/// Identifies one independently limited bucket in the window store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives keys from requests. Never fails.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Build the key for a request under a policy.
    ///
    /// Layout: `<prefix><policy>:<route>:<discriminator>`, with each
    /// component escaped so distinct tuples never collide.
    pub fn build_key(&self, request: &AdmissionRequest, policy: &RateLimitPolicy) -> RateLimitKey {
        let discriminator = discriminator(request, policy.key_strategy());
        RateLimitKey(format!(
            "{}{}:{}:{}",
            self.prefix,
            escape(policy.id()),
            escape(&request.route),
            escape(&discriminator)
        ))
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

fn discriminator(request: &AdmissionRequest, strategy: KeyStrategy) -> String {
    let ip = || {
        request
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string())
    };
    // Real identities live under `id=` so none can equal the sentinel.
    let identity = || match request.identity() {
        Some(identity) => format!("id={}", identity),
        None => ANONYMOUS.to_string(),
    };

    match strategy {
        KeyStrategy::Ip => ip(),
        KeyStrategy::IdentityAndIp => format!("{}|{}", identity(), ip()),
        KeyStrategy::IdentityOnly => identity(),
    }
}

fn escape(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::FailureMode;

    fn policy(strategy: KeyStrategy) -> RateLimitPolicy {
        RateLimitPolicy::new("api", 1000, 10, strategy, FailureMode::Open).unwrap()
    }

    fn request() -> AdmissionRequest {
        AdmissionRequest::new("/api/orders", Method::GET).with_peer_ip("10.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_ip_key_uses_peer_address() {
        let key = KeyBuilder::default().build_key(&request(), &policy(KeyStrategy::Ip));
        assert_eq!(key.as_str(), "ratewarden:api:/api/orders:10.0.0.1");
    }

    #[test]
    fn test_ip_key_prefers_first_forwarded_hop() {
        let req = request().with_forwarded_for("203.0.113.7, 10.0.0.2, 10.0.0.3");
        let key = KeyBuilder::default().build_key(&req, &policy(KeyStrategy::Ip));
        assert!(key.as_str().ends_with(":203.0.113.7"));
    }

    #[test]
    fn test_malformed_forwarded_for_falls_back_to_peer() {
        let req = request().with_forwarded_for("not-an-ip, 203.0.113.7");
        let key = KeyBuilder::default().build_key(&req, &policy(KeyStrategy::Ip));
        assert!(key.as_str().ends_with(":10.0.0.1"));
    }

    #[test]
    fn test_missing_ip_uses_sentinel() {
        let req = AdmissionRequest::new("/api", Method::GET);
        let key = KeyBuilder::default().build_key(&req, &policy(KeyStrategy::Ip));
        assert!(key.as_str().ends_with(":unknown"));
    }

    #[test]
    fn test_identity_and_ip_separates_anonymous_traffic() {
        let builder = KeyBuilder::default();
        let p = policy(KeyStrategy::IdentityAndIp);

        let anonymous = builder.build_key(&request(), &p);
        let authenticated = builder.build_key(&request().with_identity("user-1"), &p);

        assert_ne!(anonymous, authenticated);
        assert!(anonymous.as_str().ends_with(":anonymous|10.0.0.1"));
        assert!(authenticated.as_str().ends_with(":id=user-1|10.0.0.1"));
    }

    #[test]
    fn test_identity_named_like_sentinel_stays_separate() {
        let builder = KeyBuilder::default();

        for strategy in [KeyStrategy::IdentityAndIp, KeyStrategy::IdentityOnly] {
            let p = policy(strategy);
            let anonymous = builder.build_key(&request(), &p);
            let named = builder.build_key(&request().with_identity(ANONYMOUS), &p);
            assert_ne!(anonymous, named, "{:?}", strategy);
        }
    }

    #[test]
    fn test_identity_only_ignores_ip() {
        let builder = KeyBuilder::default();
        let p = policy(KeyStrategy::IdentityOnly);

        let a = builder.build_key(&request().with_identity("user-1"), &p);
        let b = builder.build_key(
            &AdmissionRequest::new("/api/orders", Method::GET)
                .with_peer_ip("192.168.1.9".parse().unwrap())
                .with_identity("user-1"),
            &p,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_only_degrades_to_anonymous() {
        let p = policy(KeyStrategy::IdentityOnly);
        let key = KeyBuilder::default().build_key(&request().with_identity("   "), &p);
        assert!(key.as_str().ends_with(":anonymous"));
    }

    #[test]
    fn test_key_is_stable_across_builders() {
        let p = policy(KeyStrategy::IdentityAndIp);
        let req = request().with_identity("user-1");
        assert_eq!(
            KeyBuilder::default().build_key(&req, &p),
            KeyBuilder::default().build_key(&req, &p)
        );
    }

    #[test]
    fn test_colons_cannot_forge_other_keys() {
        let p = policy(KeyStrategy::IdentityOnly);
        let builder = KeyBuilder::default();

        // route "/a" + identity "b:c" vs route "/a:b" + identity "c"
        let one = builder.build_key(
            &AdmissionRequest::new("/a", Method::GET).with_identity("b:c"),
            &p,
        );
        let two = builder.build_key(
            &AdmissionRequest::new("/a:b", Method::GET).with_identity("c"),
            &p,
        );
        assert_ne!(one, two);
    }

    #[test]
    fn test_ipv6_forwarded_for() {
        let req = request().with_forwarded_for("2001:db8::1");
        let key = KeyBuilder::default().build_key(&req, &policy(KeyStrategy::Ip));
        assert!(key.as_str().ends_with(":2001%3Adb8%3A%3A1"));
    }

    #[test]
    fn test_request_deserializes_from_json() {
        let req: AdmissionRequest = serde_json::from_str(
            r#"{"route":"/api","method":"post","peer_ip":"10.0.0.1","identity":"u"}"#,
        )
        .unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.identity(), Some("u"));
        assert_eq!(req.client_ip(), Some("10.0.0.1".parse().unwrap()));
    }
}
