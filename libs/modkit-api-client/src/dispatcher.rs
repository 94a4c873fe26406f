//! Route dispatch.
//!
//! One [`RouteDispatcher`] is shared by every endpoint of a client. Each route
//! of the table becomes an endpoint bound to its descriptor: buffered HTTP
//! routes become an [`HttpEndpoint`], `websocket` routes a [`SocketEndpoint`]
//! and `sse` routes a [`StreamEndpoint`].
//!
//! HTTP call sequence:
//!   request interceptors → cache read → transport (deadline, cancel) →
//!   response interceptors → cache store / invalidation
//!
//! Any failure goes through the error interceptors once per attempt.

use crate::body::UploadBody;
use crate::cache::CacheManager;
use crate::config::TransportSecurity;
use crate::error::ApiError;
use crate::interceptors::InterceptorRegistry;
use crate::payload::{CallPayload, RetryDirective};
use crate::request::{RequestConfig, validate_scheme};
use crate::response::ResponsePayload;
use crate::route::{RouteDescriptor, RouteMethod};
use crate::socket::{
    HandlerId, SocketConnection, SocketEvent, SocketEventKind, SocketManager, SocketMessage,
};
use crate::sse::StreamHandle;
use crate::transport::HttpTransport;
use crate::url::socket_address;
use http::Request;
use http::header::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Client-wide settings that the façade may change after construction.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub(crate) base_url: Url,
    pub(crate) default_headers: HeaderMap,
    pub(crate) default_timeout: Duration,
}

/// Shared state consulted by every endpoint.
pub struct RouteDispatcher {
    pub(crate) settings: RwLock<ClientSettings>,
    pub(crate) cache: CacheManager,
    pub(crate) interceptors: InterceptorRegistry,
    pub(crate) transport: HttpTransport,
    pub(crate) sockets: SocketManager,
    pub(crate) max_body_size: usize,
    pub(crate) security: TransportSecurity,
}

impl RouteDispatcher {
    fn settings(&self) -> ClientSettings {
        self.settings.read().clone()
    }

    /// Send `request` and read the body, bounded by `timeout` and `cancel`.
    ///
    /// Dropping the exchange on timeout or cancel aborts the transport call.
    async fn exchange(
        &self,
        request: Request<UploadBody>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        caching: bool,
    ) -> Result<ResponsePayload, ApiError> {
        let exchange = async {
            let response = self.transport.send(request).await?;
            ResponsePayload::from_transport(response, self.max_body_size, caching).await
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => Err(ApiError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(ApiError::Timeout(timeout)),
            result = exchange => result,
        }
    }
}

impl fmt::Debug for RouteDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDispatcher")
            .field("base_url", &self.settings.read().base_url.as_str())
            .field("cache_entries", &self.cache.len())
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

/// Endpoint manufactured for one route of the table.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Http(HttpEndpoint),
    Socket(SocketEndpoint),
    Stream(StreamEndpoint),
}

impl Endpoint {
    pub(crate) fn new(name: &str, route: RouteDescriptor, dispatcher: Arc<RouteDispatcher>) -> Self {
        let bound = BoundRoute {
            name: Arc::from(name),
            route: Arc::new(route),
            dispatcher,
        };
        match bound.route.method {
            RouteMethod::Websocket => Endpoint::Socket(SocketEndpoint { bound }),
            RouteMethod::Sse => Endpoint::Stream(StreamEndpoint { bound }),
            _ => Endpoint::Http(HttpEndpoint { bound }),
        }
    }

    #[must_use]
    pub fn route(&self) -> &RouteDescriptor {
        &self.bound().route
    }

    fn bound(&self) -> &BoundRoute {
        match self {
            Endpoint::Http(endpoint) => &endpoint.bound,
            Endpoint::Socket(endpoint) => &endpoint.bound,
            Endpoint::Stream(endpoint) => &endpoint.bound,
        }
    }
}

#[derive(Clone)]
struct BoundRoute {
    name: Arc<str>,
    route: Arc<RouteDescriptor>,
    dispatcher: Arc<RouteDispatcher>,
}

impl fmt::Debug for BoundRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundRoute")
            .field("name", &self.name)
            .field("method", &self.route.method)
            .field("path", &self.route.path)
            .finish()
    }
}

/// Callable for a buffered HTTP route.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    bound: BoundRoute,
}

impl HttpEndpoint {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.bound.name
    }

    /// Run the call, honouring the payload's retry directive.
    ///
    /// Non-2xx statuses are returned as payloads, not errors; they are never
    /// cached and never trigger invalidation.
    ///
    /// # Errors
    /// The error produced by the last attempt, after the error interceptors.
    pub async fn call(&self, payload: CallPayload) -> Result<ResponsePayload, ApiError> {
        let retry = payload
            .retry
            .unwrap_or_else(|| RetryDirective::new(1, Duration::ZERO));
        let mut attempt = 1;
        loop {
            let err = match self.attempt(&payload).await {
                Ok(response) => return Ok(response),
                Err(err) => self.bound.dispatcher.interceptors.apply_error(err).await,
            };
            if attempt >= retry.attempts || !err.is_retryable() {
                return Err(err);
            }
            tracing::debug!(
                route = %self.bound.name,
                attempt,
                max_attempts = retry.attempts,
                error = %err,
                "retrying call"
            );
            attempt += 1;
            if let Some(token) = &payload.cancel {
                tokio::select! {
                    () = token.cancelled() => {
                        let err = ApiError::Cancelled;
                        return Err(self.bound.dispatcher.interceptors.apply_error(err).await);
                    }
                    () = tokio::time::sleep(retry.delay) => {}
                }
            } else {
                tokio::time::sleep(retry.delay).await;
            }
        }
    }

    async fn attempt(&self, payload: &CallPayload) -> Result<ResponsePayload, ApiError> {
        let dispatcher = &self.bound.dispatcher;
        let settings = dispatcher.settings();

        let config = RequestConfig::from_call(
            &self.bound.name,
            &self.bound.route,
            payload,
            &settings.default_headers,
            settings.default_timeout,
        )?;
        let config = dispatcher.interceptors.apply_request(config).await?;

        let caching = config.caching();
        let cache_key = if caching {
            Some(config.cache_key()?)
        } else {
            None
        };
        let ttl = config
            .cache
            .as_ref()
            .and_then(|policy| policy.options())
            .and_then(|options| options.ttl);

        if let Some(key) = &cache_key
            && let Some((value, text)) = dispatcher.cache.get_entry(key)
        {
            match ResponsePayload::from_cache_value(&value, text) {
                Ok(response) => {
                    tracing::debug!(route = %self.bound.name, key, "cache hit");
                    let response = dispatcher.interceptors.apply_response(response).await?;
                    self.invalidate_declared();
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(route = %self.bound.name, key, error = %e, "cached value unusable; fetching");
                }
            }
        }

        let timeout = config.timeout;
        let cancel = config.cancel.clone();
        let request = config.into_http_request(&settings.base_url, dispatcher.security)?;
        tracing::debug!(
            route = %self.bound.name,
            method = %request.method(),
            uri = %request.uri(),
            "sending request"
        );

        let response = dispatcher
            .exchange(request, timeout, cancel.as_ref(), caching)
            .await?;
        tracing::debug!(route = %self.bound.name, status = %response.status(), "response received");
        let response = dispatcher.interceptors.apply_response(response).await?;

        if response.is_success() {
            if let Some(key) = cache_key {
                match serde_json::from_slice::<serde_json::Value>(response.body()) {
                    Ok(value) => dispatcher.cache.set(key, &value, ttl),
                    Err(_) => dispatcher.cache.set_text(key, response.text(), ttl),
                }
            }
            self.invalidate_declared();
        }
        Ok(response)
    }

    /// Clear the route's `invalidates` patterns after a successful call.
    fn invalidate_declared(&self) {
        let patterns = &self.bound.route.invalidates;
        if !patterns.is_empty() {
            let removed = self.bound.dispatcher.cache.invalidate(patterns);
            tracing::debug!(route = %self.bound.name, removed, "cache invalidated");
        }
    }
}

/// Handle for a `websocket` route.
///
/// The address is the route path verbatim under the current base URL, with
/// the scheme translated to `ws`/`wss`. Connections are shared per address.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    bound: BoundRoute,
}

impl SocketEndpoint {
    #[must_use]
    pub fn address(&self) -> String {
        let base = self.bound.dispatcher.settings.read().base_url.clone();
        socket_address(&base, &self.bound.route.path)
    }

    /// # Errors
    /// Returns `ApiError::InvalidScheme` or `ApiError::Network` when the
    /// connection cannot be opened.
    pub async fn connect(&self) -> Result<(), ApiError> {
        self.connect_with_protocols(&[]).await
    }

    /// # Errors
    /// Same as [`SocketEndpoint::connect`].
    pub async fn connect_with_protocols(&self, protocols: &[String]) -> Result<(), ApiError> {
        self.bound
            .dispatcher
            .sockets
            .connect(&self.address(), protocols)
            .await
    }

    #[must_use]
    pub fn socket(&self) -> Option<SocketConnection> {
        self.bound.dispatcher.sockets.socket(&self.address())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.bound.dispatcher.sockets.is_open(&self.address())
    }

    #[must_use]
    pub fn on(
        &self,
        kind: SocketEventKind,
        handler: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.bound
            .dispatcher
            .sockets
            .on(&self.address(), kind, handler)
    }

    #[must_use]
    pub fn off(&self, kind: SocketEventKind, id: HandlerId) -> bool {
        self.bound.dispatcher.sockets.off(&self.address(), kind, id)
    }

    /// # Errors
    /// Returns `ApiError::ConnectionNotOpen` without an open connection.
    pub fn send(&self, message: impl Into<SocketMessage>) -> Result<(), ApiError> {
        self.bound.dispatcher.sockets.send(&self.address(), message)
    }

    /// # Errors
    /// Returns `ApiError::Json` or `ApiError::ConnectionNotOpen`.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ApiError> {
        self.bound
            .dispatcher
            .sockets
            .send_json(&self.address(), value)
    }

    pub fn close(&self) {
        self.bound.dispatcher.sockets.close(&self.address());
    }
}

/// Factory of per-call event streams for an `sse` route.
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    bound: BoundRoute,
}

impl StreamEndpoint {
    /// Resolve the URL for this call and return an unconnected stream.
    ///
    /// Headers merge as for HTTP calls; interceptors and cache do not apply.
    ///
    /// # Errors
    /// Returns `ApiError::MissingParameter` or `ApiError::InvalidScheme`.
    pub fn open(&self, payload: &CallPayload) -> Result<StreamHandle, ApiError> {
        let dispatcher = &self.bound.dispatcher;
        let settings = dispatcher.settings();
        let config = RequestConfig::from_call(
            &self.bound.name,
            &self.bound.route,
            payload,
            &settings.default_headers,
            settings.default_timeout,
        )?;
        let url = config.url(&settings.base_url)?;
        validate_scheme(&url, dispatcher.security)?;
        tracing::debug!(route = %self.bound.name, url = %url, "stream resolved");
        Ok(StreamHandle::new(
            url,
            config.headers,
            config.timeout,
            dispatcher.transport.clone(),
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::TlsRootConfig;
    use crate::payload::CachePolicy;
    use crate::response::ResponseBody;
    use crate::socket::TungsteniteConnector;
    use bytes::Bytes;
    use http::{Response, StatusCode};
    use http_body_util::{BodyExt, Full};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn respond(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
        let body: ResponseBody = Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed();
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    fn counting_service(
        status: StatusCode,
        body: &'static str,
    ) -> (crate::transport::HttpService, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let service = tower::service_fn(move |_req: Request<UploadBody>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ApiError>(respond(status, body)) }
        })
        .boxed_clone();
        (service, calls)
    }

    fn dispatcher(service: crate::transport::HttpService) -> Arc<RouteDispatcher> {
        let connector = TungsteniteConnector::new(TlsRootConfig::WebPki, TransportSecurity::TlsOnly)
            .unwrap();
        Arc::new(RouteDispatcher {
            settings: RwLock::new(ClientSettings {
                base_url: Url::parse("https://api.example.com/v1").unwrap(),
                default_headers: HeaderMap::new(),
                default_timeout: Duration::from_secs(5),
            }),
            cache: CacheManager::default(),
            interceptors: InterceptorRegistry::new(),
            transport: HttpTransport::from_service(service, 16),
            sockets: SocketManager::new(Arc::new(connector)),
            max_body_size: 1024 * 1024,
            security: TransportSecurity::TlsOnly,
        })
    }

    fn http(name: &str, route: RouteDescriptor, dispatcher: &Arc<RouteDispatcher>) -> HttpEndpoint {
        match Endpoint::new(name, route, dispatcher.clone()) {
            Endpoint::Http(endpoint) => endpoint,
            other => panic!("expected http endpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport_but_runs_response_interceptors() {
        let (service, calls) = counting_service(StatusCode::OK, r#"[{"id":1}]"#);
        let dispatcher = dispatcher(service);
        let users = http("users", RouteDescriptor::get("/users"), &dispatcher);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = seen.clone();
        dispatcher
            .interceptors
            .response
            .add(move |resp: ResponsePayload| -> Result<_, ApiError> {
                seen_in.fetch_add(1, Ordering::SeqCst);
                Ok(resp)
            });

        let payload = || CallPayload::new().cache_ttl(Duration::from_secs(5));
        let first = users.call(payload()).await.unwrap();
        assert!(first.cached());
        assert!(!first.from_cache());

        let second = users.call(payload()).await.unwrap();
        assert!(second.from_cache());
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.value(), json!([{"id": 1}]));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache.contains("/users"));
    }

    #[tokio::test]
    async fn test_cached_json_string_replays_as_json() {
        let (service, calls) = counting_service(StatusCode::OK, r#""hello""#);
        let dispatcher = dispatcher(service);
        let greeting = http("greeting", RouteDescriptor::get("/greeting"), &dispatcher);

        let payload = || CallPayload::new().cache_ttl(Duration::from_secs(5));
        let network = greeting.call(payload()).await.unwrap();
        let cached = greeting.call(payload()).await.unwrap();

        assert!(cached.from_cache());
        assert_eq!(cached.body(), network.body());
        assert_eq!(cached.json::<String>().unwrap(), "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_plain_text_replays_as_text() {
        let (service, calls) = counting_service(StatusCode::OK, "hello");
        let dispatcher = dispatcher(service);
        let greeting = http("greeting", RouteDescriptor::get("/greeting"), &dispatcher);

        let payload = || CallPayload::new().cache_ttl(Duration::from_secs(5));
        greeting.call(payload()).await.unwrap();
        let cached = greeting.call(payload()).await.unwrap();

        assert!(cached.from_cache());
        assert_eq!(cached.text(), "hello");
        assert_eq!(dispatcher.cache.get("/greeting"), Some(json!("hello")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_still_invalidates() {
        let (service, calls) = counting_service(StatusCode::OK, r#"{"ok":true}"#);
        let dispatcher = dispatcher(service);
        let refresh = http(
            "refresh",
            RouteDescriptor::get("/session").invalidates(["drafts"]),
            &dispatcher,
        );
        dispatcher.cache.set("/session", &json!({"ok": true}), None);
        dispatcher.cache.set("drafts", &json!([1]), None);

        let response = refresh
            .call(CallPayload::new().cache(CachePolicy::enabled()))
            .await
            .unwrap();

        assert!(response.from_cache());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.cache.get("drafts").is_none());
        assert!(dispatcher.cache.contains("/session"));
    }

    #[tokio::test]
    async fn test_error_status_not_cached() {
        let (service, calls) = counting_service(StatusCode::NOT_FOUND, r#"{"error":"nope"}"#);
        let dispatcher = dispatcher(service);
        let users = http("users", RouteDescriptor::get("/users"), &dispatcher);

        let response = users
            .call(CallPayload::new().cache(CachePolicy::enabled()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        users
            .call(CallPayload::new().cache(CachePolicy::enabled()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache.is_empty());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_on_success() {
        let (service, _calls) = counting_service(StatusCode::CREATED, r#"{"id":2}"#);
        let dispatcher = dispatcher(service);
        dispatcher.cache.set("users-list", &json!([1]), None);
        dispatcher.cache.set("orders", &json!([1]), None);
        let create = http(
            "createUser",
            RouteDescriptor::post("/users").invalidates(["users-list"]),
            &dispatcher,
        );

        let response = create
            .call(CallPayload::new().json(&json!({"name": "John"})).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!response.cached());
        assert!(dispatcher.cache.get("users-list").is_none());
        assert!(dispatcher.cache.contains("orders"));
    }

    #[tokio::test]
    async fn test_missing_param_runs_error_chain_without_transport() {
        let (service, calls) = counting_service(StatusCode::OK, "{}");
        let dispatcher = dispatcher(service);
        dispatcher
            .interceptors
            .error
            .add(|err: ApiError| err.intercepted("users API failed"));
        let get_user = http("getUser", RouteDescriptor::get("/users/:id"), &dispatcher);

        let err = get_user.call(CallPayload::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "users API failed");
        assert!(matches!(err.root(), ApiError::MissingParameter { name, .. } if name == "id"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_names_duration() {
        let never: crate::transport::HttpService =
            tower::service_fn(|_req: Request<UploadBody>| {
                std::future::pending::<Result<Response<ResponseBody>, ApiError>>()
            })
            .boxed_clone();
        let dispatcher = dispatcher(never);
        let slow = http("slow", RouteDescriptor::get("/slow"), &dispatcher);

        let err = slow
            .call(CallPayload::new().timeout(Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout(d) if d == Duration::from_millis(1)));
        assert!(err.to_string().contains('1'));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_call() {
        let never: crate::transport::HttpService =
            tower::service_fn(|_req: Request<UploadBody>| {
                std::future::pending::<Result<Response<ResponseBody>, ApiError>>()
            })
            .boxed_clone();
        let dispatcher = dispatcher(never);
        let slow = http("slow", RouteDescriptor::get("/slow"), &dispatcher);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = slow
            .call(CallPayload::new().cancel_token(token))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Cancelled));
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_retry_reruns_whole_sequence() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky: crate::transport::HttpService =
            tower::service_fn(move |_req: Request<UploadBody>| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ApiError::Network("connection reset".into()))
                    } else {
                        Ok(respond(StatusCode::OK, r#"{"ok":true}"#))
                    }
                }
            })
            .boxed_clone();
        let dispatcher = dispatcher(flaky);
        let request_runs = Arc::new(AtomicUsize::new(0));
        let runs = request_runs.clone();
        dispatcher
            .interceptors
            .request
            .add(move |config: RequestConfig| -> Result<_, ApiError> {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(config)
            });
        let ping = http("ping", RouteDescriptor::get("/ping"), &dispatcher);

        let response = ping
            .call(CallPayload::new().retry(RetryDirective::new(3, Duration::from_millis(1))))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(request_runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let (service, _calls) = counting_service(StatusCode::OK, "{}");
        let dispatcher = dispatcher(service);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        dispatcher
            .interceptors
            .request
            .add(move |_config: RequestConfig| -> Result<RequestConfig, ApiError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::configuration("no token"))
            });
        let ping = http("ping", RouteDescriptor::get("/ping"), &dispatcher);

        let err = ping
            .call(CallPayload::new().retry(RetryDirective::new(5, Duration::ZERO)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Configuration { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_socket_endpoint_address_and_send_without_connection() {
        let (service, _calls) = counting_service(StatusCode::OK, "{}");
        let dispatcher = dispatcher(service);
        let Endpoint::Socket(chat) = Endpoint::new(
            "chat",
            RouteDescriptor::websocket("/chat/:room"),
            dispatcher.clone(),
        ) else {
            panic!("expected socket endpoint");
        };

        assert_eq!(chat.address(), "wss://api.example.com/v1/chat/:room");
        assert!(!chat.is_open());
        assert!(chat.socket().is_none());
        assert!(matches!(
            chat.send("hello"),
            Err(ApiError::ConnectionNotOpen { .. })
        ));

        dispatcher.settings.write().base_url = Url::parse("https://other.example.com").unwrap();
        assert_eq!(chat.address(), "wss://other.example.com/chat/:room");
    }

    #[tokio::test]
    async fn test_stream_endpoint_resolves_url_per_call() {
        let (service, _calls) = counting_service(StatusCode::OK, "");
        let dispatcher = dispatcher(service);
        let Endpoint::Stream(feed) = Endpoint::new(
            "feed",
            RouteDescriptor::sse("/feeds/:id").header("x-feed", "live"),
            dispatcher,
        ) else {
            panic!("expected stream endpoint");
        };

        let stream = feed
            .open(&CallPayload::new().param("id", 7).query("since", 10))
            .unwrap();
        assert_eq!(
            stream.url().as_str(),
            "https://api.example.com/v1/feeds/7?since=10"
        );
        assert!(stream.event().is_none());

        let err = feed.open(&CallPayload::new()).unwrap_err();
        assert!(matches!(err, ApiError::MissingParameter { .. }));
    }
}
