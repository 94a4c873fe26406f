use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default User-Agent string for outgoing requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-api-client/", env!("CARGO_PKG_VERSION"));

/// Default per-call deadline when neither the call nor the client sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of cached responses
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default cache entry lifetime (300 000 ms)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(300_000);

/// Default maximum response body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
///
/// Controls whether the client enforces TLS or allows plain-text transports.
/// The same policy covers `http`/`https` requests and `ws`/`wss` sockets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections - default and recommended
    #[default]
    TlsOnly,
    /// Allow insecure HTTP and WS connections (for testing with mock servers only)
    AllowInsecureHttp,
}

/// API client configuration
///
/// Deserializable so it can be embedded in a module's config section:
///
/// ```yaml
/// base_url: "https://api.example.com/v1"
/// default_timeout: "10s"
/// cache_ttl: "5m"
/// default_headers:
///   x-client: "billing"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiClientConfig {
    /// Absolute base address every route path is appended to (required)
    pub base_url: Option<String>,

    /// Headers sent with every call; route and call headers override them
    pub default_headers: BTreeMap<String, String>,

    /// Per-call deadline applied when the call does not set its own (default: 30s)
    #[serde(with = "crate::humantime_serde")]
    pub default_timeout: Duration,

    /// Maximum number of cache entries before FIFO eviction (default: 100)
    pub cache_capacity: usize,

    /// Lifetime of cache entries stored without an explicit TTL (default: 300s)
    #[serde(with = "crate::humantime_serde")]
    pub cache_ttl: Duration,

    /// User-Agent header value
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10 MiB)
    pub max_body_size: usize,

    /// Capacity of the request buffer in front of the HTTP service (default: 1024)
    pub buffer_capacity: usize,

    /// Transport security mode (default: `TlsOnly`)
    pub transport: TransportSecurity,

    /// TLS root certificate source (default: `WebPki`)
    pub tls_roots: TlsRootConfig,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: BTreeMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            buffer_capacity: 1024,
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::WebPki,
        }
    }
}

impl ApiClientConfig {
    /// Create a config pointing at `base_url` with all other settings defaulted
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }
}
