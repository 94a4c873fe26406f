use crate::body::{self, UploadBody};
use crate::config::TransportSecurity;
use crate::error::ApiError;
use crate::payload::{Body, CachePolicy, CallPayload, ProgressCallback};
use crate::route::{RouteDescriptor, RouteMethod};
use crate::url::{build_url, cache_key, flatten_query, substitute_path};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Request;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Mutable description of one outgoing HTTP call.
///
/// Built from the route descriptor, the call payload and the client
/// defaults, then handed through the request interceptor chain. Whatever the
/// last interceptor returns is what goes on the wire.
///
/// Headers are already merged with priority call > route > client default.
#[must_use]
pub struct RequestConfig {
    /// Route name in the route table
    pub route: String,
    pub method: RouteMethod,
    /// Path template with `:name` placeholders
    pub path: String,
    pub params: Map<String, Value>,
    pub query: Map<String, Value>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    /// Effective cache policy (call-level over route-level)
    pub cache: Option<CachePolicy>,
    pub timeout: Duration,
    pub(crate) on_upload_progress: Option<ProgressCallback>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl RequestConfig {
    pub(crate) fn from_call(
        route_name: &str,
        route: &RouteDescriptor,
        payload: &CallPayload,
        default_headers: &HeaderMap,
        default_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = default_headers.clone();
        for (name, value) in &route.headers {
            headers.insert(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }
        let mut call_headers = HeaderMap::new();
        for (name, value) in &payload.headers {
            call_headers.append(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }
        // Replace lower-priority values per name, keep repeated call values
        for name in call_headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &call_headers {
            headers.append(name.clone(), value.clone());
        }

        Ok(Self {
            route: route_name.to_owned(),
            method: route.method,
            path: route.path.clone(),
            params: payload.params.clone(),
            query: payload.query.clone(),
            headers,
            body: payload.body.clone(),
            cache: payload.cache.clone().or_else(|| route.cache.clone()),
            timeout: payload.timeout.unwrap_or(default_timeout),
            on_upload_progress: payload.on_upload_progress.clone(),
            cancel: payload.cancel.clone(),
        })
    }

    /// Set or replace one header.
    ///
    /// # Errors
    /// Returns `ApiError::InvalidHeaderName`/`InvalidHeaderValue` for malformed input.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ApiError> {
        self.headers
            .insert(HeaderName::try_from(name)?, HeaderValue::try_from(value)?);
        Ok(())
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// True when this call reads and stores the cache.
    #[must_use]
    pub fn caching(&self) -> bool {
        self.method.is_safe_read() && matches!(self.cache, Some(CachePolicy::Enabled(_)))
    }

    /// Path with every placeholder substituted.
    ///
    /// # Errors
    /// Returns `ApiError::MissingParameter` for an absent or null param.
    pub fn resolved_path(&self) -> Result<String, ApiError> {
        substitute_path(&self.path, &self.params)
    }

    /// Cache key: override key or resolved path, plus the flattened query.
    ///
    /// # Errors
    /// Returns `ApiError::MissingParameter` when the path cannot be resolved.
    pub fn cache_key(&self) -> Result<String, ApiError> {
        let key_override = self
            .cache
            .as_ref()
            .and_then(CachePolicy::options)
            .and_then(|options| options.key.clone());
        let base = match key_override {
            Some(key) => key,
            None => self.resolved_path()?,
        };
        Ok(cache_key(&base, &flatten_query(&self.query)))
    }

    /// Fully resolved request URL.
    ///
    /// # Errors
    /// Returns `ApiError::MissingParameter` or `ApiError::Configuration`.
    pub fn url(&self, base: &Url) -> Result<Url, ApiError> {
        build_url(base, &self.resolved_path()?, &flatten_query(&self.query))
    }

    /// Build the wire request.
    ///
    /// The body is encoded only for methods that carry one. Multipart and
    /// form encodings set their own `Content-Type`; JSON keeps a
    /// caller-supplied one and defaults to `application/json`.
    pub(crate) fn into_http_request(
        self,
        base: &Url,
        security: TransportSecurity,
    ) -> Result<Request<UploadBody>, ApiError> {
        let url = self.url(base)?;
        let uri = validate_scheme(&url, security)?;
        let method = self.method.http_method().ok_or_else(|| {
            ApiError::configuration(format!(
                "route '{}' uses {} and is not a buffered HTTP route",
                self.route, self.method
            ))
        })?;

        let mut headers = self.headers;
        let body = match self.body.as_ref().filter(|_| self.method.permits_body()) {
            Some(payload) => {
                let encoded = body::encode(payload, headers.get(CONTENT_TYPE))?;
                if let Some(content_type) = encoded.content_type
                    && (encoded.multipart || !headers.contains_key(CONTENT_TYPE))
                {
                    headers.insert(CONTENT_TYPE, content_type);
                }
                let progress = if encoded.multipart {
                    self.on_upload_progress
                } else {
                    None
                };
                UploadBody::new(encoded.bytes, progress)
            }
            None => UploadBody::empty(),
        };

        let mut request = Request::builder().method(method).uri(uri).body(body)?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

/// Check the URL scheme against the transport security mode.
///
/// # Errors
/// Returns `ApiError::InvalidScheme` for `http` under `TlsOnly` and for any
/// scheme other than `http`/`https`.
pub fn validate_scheme(url: &Url, security: TransportSecurity) -> Result<http::Uri, ApiError> {
    match url.scheme() {
        "https" => {}
        "http" => {
            if security == TransportSecurity::TlsOnly {
                return Err(ApiError::InvalidScheme {
                    scheme: "http".to_owned(),
                    reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                });
            }
        }
        other => {
            return Err(ApiError::InvalidScheme {
                scheme: other.to_owned(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            });
        }
    }
    url.as_str().parse().map_err(|e: http::uri::InvalidUri| {
        ApiError::configuration(format!("invalid URL '{url}': {e}"))
    })
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("route", &self.route)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
