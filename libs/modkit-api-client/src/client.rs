use crate::builder::ApiClientBuilder;
use crate::cache::CacheManager;
use crate::dispatcher::{Endpoint, HttpEndpoint, RouteDispatcher, SocketEndpoint};
use crate::error::ApiError;
use crate::interceptors::InterceptorRegistry;
use crate::payload::CallPayload;
use crate::response::ResponsePayload;
use crate::sse::StreamHandle;
use crate::url::parse_base_url;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Declarative API client.
///
/// Every route of the table is turned into an endpoint at build time and
/// looked up by name:
///
/// ```ignore
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com/v1")
///     .routes(RouteTable::from_json_str(ROUTES)?)
///     .build()?;
///
/// let users: Vec<User> = client
///     .call("listUsers", CallPayload::new().cache_ttl(Duration::from_secs(5)))
///     .await?
///     .json()?;
///
/// let chat = client.socket("chat")?;
/// let _id = chat.on(SocketEventKind::Message, |event| tracing::info!(?event, "chat"));
/// chat.connect().await?;
/// ```
///
/// `ApiClient` is `Clone + Send + Sync`; clones share cache, interceptors,
/// sockets and settings. Setting changes apply to calls started afterwards.
#[derive(Clone)]
pub struct ApiClient {
    dispatcher: Arc<RouteDispatcher>,
    endpoints: Arc<BTreeMap<String, Endpoint>>,
}

impl ApiClient {
    pub(crate) fn new(
        dispatcher: Arc<RouteDispatcher>,
        endpoints: BTreeMap<String, Endpoint>,
    ) -> Self {
        Self {
            dispatcher,
            endpoints: Arc::new(endpoints),
        }
    }

    #[must_use]
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    /// Endpoint for `name`.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for an unknown route.
    pub fn endpoint(&self, name: &str) -> Result<&Endpoint, ApiError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| ApiError::configuration(format!("unknown route '{name}'")))
    }

    /// Route names in sorted order.
    #[must_use]
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Reusable callable for a buffered HTTP route.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for an unknown or non-HTTP route.
    pub fn http(&self, name: &str) -> Result<HttpEndpoint, ApiError> {
        match self.endpoint(name)? {
            Endpoint::Http(endpoint) => Ok(endpoint.clone()),
            other => Err(wrong_kind(name, other)),
        }
    }

    /// Call a buffered HTTP route.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for an unknown or non-HTTP route, or
    /// whatever the call fails with (see [`HttpEndpoint::call`]).
    pub async fn call(&self, name: &str, payload: CallPayload) -> Result<ResponsePayload, ApiError> {
        self.http(name)?.call(payload).await
    }

    /// Handle of a `websocket` route.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for an unknown or non-socket route.
    pub fn socket(&self, name: &str) -> Result<SocketEndpoint, ApiError> {
        match self.endpoint(name)? {
            Endpoint::Socket(endpoint) => Ok(endpoint.clone()),
            other => Err(wrong_kind(name, other)),
        }
    }

    /// New, unconnected event stream for an `sse` route.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` for an unknown or non-stream route,
    /// `ApiError::MissingParameter` when the path cannot be resolved.
    pub fn stream(&self, name: &str, payload: &CallPayload) -> Result<StreamHandle, ApiError> {
        match self.endpoint(name)? {
            Endpoint::Stream(endpoint) => endpoint.open(payload),
            other => Err(wrong_kind(name, other)),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> Url {
        self.dispatcher.settings.read().base_url.clone()
    }

    /// Replace the base address.
    ///
    /// # Errors
    /// Returns `ApiError::Configuration` if `base_url` is not an absolute URL;
    /// the previous address stays in effect.
    pub fn set_base_url(&self, base_url: &str) -> Result<(), ApiError> {
        let url = parse_base_url(base_url)?;
        tracing::debug!(base_url, "base URL changed");
        self.dispatcher.settings.write().base_url = url;
        Ok(())
    }

    #[must_use]
    pub fn default_headers(&self) -> HeaderMap {
        self.dispatcher.settings.read().default_headers.clone()
    }

    /// Merge `headers` into the default headers; other defaults are kept.
    ///
    /// # Errors
    /// Returns a header error for malformed input; nothing is applied then.
    pub fn set_default_headers<I, K, V>(&self, headers: I) -> Result<(), ApiError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let parsed = headers
            .into_iter()
            .map(|(name, value)| {
                Ok((
                    HeaderName::try_from(name.as_ref())?,
                    HeaderValue::try_from(value.as_ref())?,
                ))
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        let mut settings = self.dispatcher.settings.write();
        for (name, value) in parsed {
            settings.default_headers.insert(name, value);
        }
        Ok(())
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.dispatcher.settings.read().default_timeout
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.dispatcher.settings.write().default_timeout = timeout;
    }

    /// Shared response cache.
    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.dispatcher.cache
    }

    /// Request, response and error interceptor chains.
    #[must_use]
    pub fn interceptors(&self) -> &InterceptorRegistry {
        &self.dispatcher.interceptors
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("dispatcher", &self.dispatcher)
            .field("routes", &self.endpoints.len())
            .finish()
    }
}

fn wrong_kind(name: &str, endpoint: &Endpoint) -> ApiError {
    ApiError::configuration(format!(
        "route '{name}' is a {} route",
        endpoint.route().method
    ))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::UploadBody;
    use crate::request::RequestConfig;
    use crate::response::ResponseBody;
    use crate::route::RouteTable;
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::{BodyExt, Full};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Answers every request with its URI and headers as JSON.
    fn echo_service() -> crate::transport::HttpService {
        tower::service_fn(|req: Request<UploadBody>| async move {
            let headers: serde_json::Map<String, Value> = req
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        Value::String(value.to_str().unwrap_or_default().to_owned()),
                    )
                })
                .collect();
            let echo = json!({ "uri": req.uri().to_string(), "headers": headers });
            let body: ResponseBody = Full::new(Bytes::from(serde_json::to_vec(&echo).unwrap()))
                .map_err(|never| match never {})
                .boxed();
            Ok::<_, ApiError>(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
        })
        .boxed_clone()
    }

    fn client() -> ApiClient {
        let routes = RouteTable::from_json_str(
            r#"{
                "getUser": { "path": "/users/:id", "method": "get", "headers": { "x-scope": "route" } },
                "chat": { "path": "/chat", "method": "websocket" },
                "feed": { "path": "/feed/:topic", "method": "sse" }
            }"#,
        )
        .unwrap();
        ApiClient::builder()
            .base_url("https://api.example.com/v1")
            .default_header("x-scope", "client")
            .default_header("x-client", "billing")
            .routes(routes)
            .http_service(echo_service())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_header_priority_call_route_default() {
        let client = client();
        let echo: Value = client
            .call(
                "getUser",
                CallPayload::new().param("id", 7).header("x-request-id", "r1"),
            )
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(echo["uri"], "https://api.example.com/v1/users/7");
        assert_eq!(echo["headers"]["x-scope"], "route");
        assert_eq!(echo["headers"]["x-client"], "billing");
        assert_eq!(echo["headers"]["x-request-id"], "r1");

        let echo: Value = client
            .call(
                "getUser",
                CallPayload::new().param("id", 7).header("x-scope", "call"),
            )
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(echo["headers"]["x-scope"], "call");
    }

    #[tokio::test]
    async fn test_unknown_and_mismatched_routes() {
        let client = client();
        assert!(matches!(
            client.call("nope", CallPayload::new()).await,
            Err(ApiError::Configuration { .. })
        ));
        let err = client.call("chat", CallPayload::new()).await.unwrap_err();
        assert!(err.to_string().contains("websocket"));
        assert!(client.socket("getUser").is_err());
        assert!(client.stream("chat", &CallPayload::new()).is_err());
        assert_eq!(client.routes().collect::<Vec<_>>(), vec!["chat", "feed", "getUser"]);
    }

    #[tokio::test]
    async fn test_set_default_headers_merges() {
        let client = client();
        client
            .set_default_headers([("authorization", "Bearer t"), ("x-client", "ledger")])
            .unwrap();
        let headers = client.default_headers();
        assert_eq!(headers["authorization"], "Bearer t");
        assert_eq!(headers["x-client"], "ledger");
        assert_eq!(headers["x-scope"], "client");

        assert!(client.set_default_headers([("bad header", "v")]).is_err());
        assert!(!client.default_headers().contains_key("bad header"));
    }

    #[tokio::test]
    async fn test_set_base_url_applies_to_later_calls() {
        let client = client();
        assert!(matches!(
            client.set_base_url("not a url"),
            Err(ApiError::Configuration { .. })
        ));
        assert_eq!(client.base_url().as_str(), "https://api.example.com/v1");

        client.set_base_url("https://eu.example.com").unwrap();
        let echo: Value = client
            .call("getUser", CallPayload::new().param("id", 1))
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(echo["uri"], "https://eu.example.com/users/1");
        assert_eq!(client.socket("chat").unwrap().address(), "wss://eu.example.com/chat");
    }

    #[tokio::test]
    async fn test_set_default_timeout() {
        let client = client();
        client.set_default_timeout(Duration::from_millis(250));
        assert_eq!(client.default_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_interceptors_shared_between_clones() {
        let client = client();
        let clone = client.clone();
        clone
            .interceptors()
            .request
            .add(|mut config: RequestConfig| -> Result<_, ApiError> {
                config.set_header("x-scope", "interceptor")?;
                Ok(config)
            });

        let echo: Value = client
            .call("getUser", CallPayload::new().param("id", 3))
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(echo["headers"]["x-scope"], "interceptor");
        assert_eq!(client.interceptors().request.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_handle_per_call() {
        let client = client();
        let first = client
            .stream("feed", &CallPayload::new().param("topic", "a"))
            .unwrap();
        let second = client
            .stream("feed", &CallPayload::new().param("topic", "b"))
            .unwrap();
        assert_eq!(first.url().path(), "/v1/feed/a");
        assert_eq!(second.url().path(), "/v1/feed/b");
    }
}
