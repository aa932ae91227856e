//! Request identity and storage key derivation.

use serde::{Deserialize, Serialize};

use super::rules::Scope;

/// Rendered in place of any identity field the request did not carry.
pub const UNKNOWN: &str = "unknown";

/// Identity of the request being checked.
///
/// Only the fields relevant to a rule's [`Scope`] are read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitContext {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub ip_address: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
}

impl RateLimitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    pub fn ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn endpoint(mut self, method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// The storage key a rule derives for one request.
///
/// Rendered as `{rule}:{scope suffix}`. Missing identity fields render as
/// [`UNKNOWN`] so an anonymous request still lands on a stable counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The rule this key belongs to
    pub rule: String,
    /// The scope portion, e.g. `tenant:acme`
    pub suffix: String,
}

impl LimitKey {
    /// Derive the key for `context` under `scope`.
    pub fn new(rule: &str, scope: Scope, context: &RateLimitContext) -> Self {
        Self {
            rule: rule.to_string(),
            suffix: scope_suffix(scope, context),
        }
    }

    /// Full key, e.g. `login:ip:10.0.0.1`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.rule, self.suffix)
    }

    /// Whether `entry` names this key, either in full or by its scope suffix.
    pub fn matches(&self, entry: &str) -> bool {
        entry == self.suffix || entry == self.to_string_key()
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule, self.suffix)
    }
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(UNKNOWN)
}

fn scope_suffix(scope: Scope, ctx: &RateLimitContext) -> String {
    match scope {
        Scope::Global => "global".to_string(),
        Scope::Tenant => format!("tenant:{}", field(&ctx.tenant_id)),
        Scope::User => format!("user:{}", field(&ctx.user_id)),
        Scope::ApiKey => format!("apikey:{}", field(&ctx.api_key_id)),
        Scope::Ip => format!("ip:{}", field(&ctx.ip_address)),
        Scope::Endpoint => format!(
            "endpoint:{}:{}",
            field(&ctx.method),
            field(&ctx.endpoint)
        ),
        Scope::Composite => [
            field(&ctx.tenant_id),
            field(&ctx.user_id),
            field(&ctx.endpoint),
        ]
        .join(":"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_keys() {
        let ctx = RateLimitContext::new()
            .tenant("acme")
            .user("u-1")
            .api_key("k-9")
            .ip("10.0.0.1")
            .endpoint("POST", "/login");

        let cases = [
            (Scope::Global, "rule:global"),
            (Scope::Tenant, "rule:tenant:acme"),
            (Scope::User, "rule:user:u-1"),
            (Scope::ApiKey, "rule:apikey:k-9"),
            (Scope::Ip, "rule:ip:10.0.0.1"),
            (Scope::Endpoint, "rule:endpoint:POST:/login"),
            (Scope::Composite, "rule:acme:u-1:/login"),
        ];

        for (scope, expected) in cases {
            assert_eq!(LimitKey::new("rule", scope, &ctx).to_string_key(), expected);
        }
    }

    #[test]
    fn test_missing_fields_render_unknown() {
        let ctx = RateLimitContext::new().tenant("acme");

        let key = LimitKey::new("rule", Scope::Ip, &ctx);
        assert_eq!(key.to_string(), "rule:ip:unknown");

        let key = LimitKey::new("rule", Scope::Composite, &ctx);
        assert_eq!(key.to_string(), "rule:acme:unknown:unknown");
    }

    #[test]
    fn test_key_matching() {
        let ctx = RateLimitContext::new().ip("127.0.0.1");
        let key = LimitKey::new("api", Scope::Ip, &ctx);

        assert!(key.matches("ip:127.0.0.1"));
        assert!(key.matches("api:ip:127.0.0.1"));
        assert!(!key.matches("127.0.0.1"));
        assert!(!key.matches("other:ip:127.0.0.1"));
    }
}
