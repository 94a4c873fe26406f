use crate::cache::CacheManager;
use crate::client::ApiClient;
use crate::config::{ApiClientConfig, TlsRootConfig, TransportSecurity};
use crate::dispatcher::{ClientSettings, Endpoint, RouteDispatcher};
use crate::error::ApiError;
use crate::interceptors::InterceptorRegistry;
use crate::route::RouteTable;
use crate::socket::{SocketConnector, SocketManager, TungsteniteConnector};
use crate::transport::{HttpService, HttpTransport};
use crate::url::parse_base_url;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Builder for an [`ApiClient`] bound to a route table.
pub struct ApiClientBuilder {
    config: ApiClientConfig,
    routes: Option<RouteTable>,
    http_service: Option<HttpService>,
    socket_connector: Option<Arc<dyn SocketConnector>>,
}

impl ApiClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ApiClientConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: ApiClientConfig) -> Self {
        Self {
            config,
            routes: None,
            http_service: None,
            socket_connector: None,
        }
    }

    /// Set the absolute base address route paths are appended to
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Set the route table; required
    #[must_use]
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Add one default header, replacing an earlier value for the same name
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the deadline for calls that do not carry their own
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the maximum number of cache entries
    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Set the lifetime of cache entries stored without an explicit TTL
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the maximum response body size
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the buffer capacity for concurrent request handling
    ///
    /// **Note**: A capacity of 0 is invalid and will be clamped to 1.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Set transport security mode
    ///
    /// Use `TransportSecurity::AllowInsecureHttp` only for testing with mock servers.
    #[must_use]
    pub fn transport(mut self, transport: TransportSecurity) -> Self {
        self.config.transport = transport;
        self
    }

    /// Allow insecure HTTP and WS connections (for testing only)
    ///
    /// Equivalent to `.transport(TransportSecurity::AllowInsecureHttp)`.
    ///
    /// # Compile-time Safety
    ///
    /// This method is only available in debug builds or when the `allow-insecure-http`
    /// feature is explicitly enabled.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(
            target: "modkit_api_client::security",
            "allow_insecure_http() called - HTTP traffic will NOT be encrypted"
        );
        self.config.transport = TransportSecurity::AllowInsecureHttp;
        self
    }

    /// Set the TLS root certificate source
    #[must_use]
    pub fn tls_roots(mut self, tls_roots: TlsRootConfig) -> Self {
        self.config.tls_roots = tls_roots;
        self
    }

    /// Replace the hyper stack with a custom service.
    ///
    /// The service still sits behind the request buffer; timeouts,
    /// cancellation and retries keep working.
    #[must_use]
    pub fn http_service(mut self, service: HttpService) -> Self {
        self.http_service = Some(service);
        self
    }

    /// Replace the tungstenite socket connector
    #[must_use]
    pub fn socket_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.socket_connector = Some(connector);
        self
    }

    /// Build the client and one endpoint per route.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for a missing or malformed base URL
    /// or a missing route table, header errors for malformed default headers
    /// and `ApiError::Tls` if TLS initialization fails.
    pub fn build(self) -> Result<ApiClient, ApiError> {
        if self.config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let raw_base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| ApiError::configuration("base URL is required"))?;
        let base_url = parse_base_url(raw_base)?;
        let routes = self
            .routes
            .ok_or_else(|| ApiError::configuration("route table is required"))?;
        let default_headers = header_map(&self.config.default_headers)?;

        let transport = match self.http_service {
            Some(service) => HttpTransport::from_service(service, self.config.buffer_capacity),
            None => HttpTransport::hyper(
                &self.config.user_agent,
                self.config.tls_roots,
                self.config.transport,
                self.config.buffer_capacity,
            )?,
        };
        let connector: Arc<dyn SocketConnector> = match self.socket_connector {
            Some(connector) => connector,
            None => Arc::new(TungsteniteConnector::new(
                self.config.tls_roots,
                self.config.transport,
            )?),
        };

        let dispatcher = Arc::new(RouteDispatcher {
            settings: RwLock::new(ClientSettings {
                base_url,
                default_headers,
                default_timeout: self.config.default_timeout,
            }),
            cache: CacheManager::new(self.config.cache_capacity, self.config.cache_ttl),
            interceptors: InterceptorRegistry::new(),
            transport,
            sockets: SocketManager::new(connector),
            max_body_size: self.config.max_body_size,
            security: self.config.transport,
        });

        let endpoints: BTreeMap<String, Endpoint> = routes
            .iter()
            .map(|(name, route)| {
                (
                    name.to_owned(),
                    Endpoint::new(name, route.clone(), Arc::clone(&dispatcher)),
                )
            })
            .collect();
        tracing::debug!(
            base_url = raw_base,
            routes = endpoints.len(),
            "api client built"
        );

        Ok(ApiClient::new(dispatcher, endpoints))
    }
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ApiError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        map.insert(
            HeaderName::try_from(name.as_str())?,
            HeaderValue::try_from(value.as_str())?,
        );
    }
    Ok(map)
}
