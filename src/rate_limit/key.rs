//! Partition-key derivation.
//!
//! Each config maps a request to a key; state lives under `(config id, key)`. The
//! canonical strategies cover the usual gateway partitions and `Custom` takes any
//! function of the context.

use std::fmt;
use std::sync::Arc;

use super::RateLimitContext;

/// User-supplied key derivation.
pub type KeyFn = Arc<dyn Fn(&RateLimitContext) -> String + Send + Sync>;

/// How a config derives the partition key from a request.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum KeyStrategy {
    /// Client IP address.
    Ip,
    /// User id, `"anonymous"` when absent.
    User,
    /// Organization id, `"default"` when absent.
    Organization,
    /// API key, `"no-key"` when absent.
    ApiKey,
    /// `METHOD:path`.
    Endpoint,
    /// `user:METHOD:path`, with the user falling back to `"anonymous"`.
    UserEndpoint,
    /// One shared key for every request.
    Global,
    /// Arbitrary derivation.
    #[cfg_attr(feature = "serde", serde(skip))]
    Custom(KeyFn),
}

impl KeyStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RateLimitContext) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    pub fn derive(&self, ctx: &RateLimitContext) -> String {
        match self {
            KeyStrategy::Ip => ctx.ip_address.clone(),
            KeyStrategy::User => ctx.user_id.clone().unwrap_or_else(|| "anonymous".to_string()),
            KeyStrategy::Organization => {
                ctx.organization_id.clone().unwrap_or_else(|| "default".to_string())
            }
            KeyStrategy::ApiKey => ctx.api_key.clone().unwrap_or_else(|| "no-key".to_string()),
            KeyStrategy::Endpoint => format!("{}:{}", ctx.method, ctx.endpoint),
            KeyStrategy::UserEndpoint => format!(
                "{}:{}:{}",
                ctx.user_id.as_deref().unwrap_or("anonymous"),
                ctx.method,
                ctx.endpoint
            ),
            KeyStrategy::Global => "global".to_string(),
            KeyStrategy::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => f.write_str("Ip"),
            KeyStrategy::User => f.write_str("User"),
            KeyStrategy::Organization => f.write_str("Organization"),
            KeyStrategy::ApiKey => f.write_str("ApiKey"),
            KeyStrategy::Endpoint => f.write_str("Endpoint"),
            KeyStrategy::UserEndpoint => f.write_str("UserEndpoint"),
            KeyStrategy::Global => f.write_str("Global"),
            KeyStrategy::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RateLimitContext {
        RateLimitContext::new("203.0.113.9", "POST", "/v1/webhooks")
    }

    #[test]
    fn fallbacks_for_missing_identity() {
        assert_eq!(KeyStrategy::Ip.derive(&ctx()), "203.0.113.9");
        assert_eq!(KeyStrategy::User.derive(&ctx()), "anonymous");
        assert_eq!(KeyStrategy::Organization.derive(&ctx()), "default");
        assert_eq!(KeyStrategy::ApiKey.derive(&ctx()), "no-key");
        assert_eq!(KeyStrategy::Global.derive(&ctx()), "global");
    }

    #[test]
    fn endpoint_keys_include_method() {
        assert_eq!(KeyStrategy::Endpoint.derive(&ctx()), "POST:/v1/webhooks");
        assert_eq!(
            KeyStrategy::UserEndpoint.derive(&ctx().with_user("u7")),
            "u7:POST:/v1/webhooks"
        );
        assert_eq!(KeyStrategy::UserEndpoint.derive(&ctx()), "anonymous:POST:/v1/webhooks");
    }

    #[test]
    fn present_identity_wins() {
        let c = ctx().with_user("u1").with_organization("acme").with_api_key("k-1");
        assert_eq!(KeyStrategy::User.derive(&c), "u1");
        assert_eq!(KeyStrategy::Organization.derive(&c), "acme");
        assert_eq!(KeyStrategy::ApiKey.derive(&c), "k-1");
    }

    #[test]
    fn custom_strategy_runs_closure() {
        let key = KeyStrategy::custom(|c| format!("tenant-{}", c.ip_address.len()));
        assert_eq!(key.derive(&ctx()), "tenant-11");
        assert_eq!(format!("{:?}", key), "Custom(<fn>)");
    }
}
