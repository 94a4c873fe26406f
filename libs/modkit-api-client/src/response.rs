use crate::error::ApiError;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Type alias for the boxed response body that supports decompression.
///
/// This type can hold either a raw body or a decompressed body (gzip/br/deflate).
/// The body is type-erased to allow the decompression layer to work transparently.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Buffered result of one HTTP route call.
///
/// - `cached` is true when the call was eligible for caching (a cache policy
///   was in effect and the route is a safe read)
/// - `from_cache` is true when this payload was served without a network
///   round trip
///
/// Non-2xx statuses are returned as payloads, not errors; check
/// [`is_success`](Self::is_success) when the status matters.
#[derive(Debug, Clone)]
pub struct ResponsePayload {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    cached: bool,
    from_cache: bool,
}

impl ResponsePayload {
    /// Build a payload from parts, e.g. in tests or response interceptors.
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            cached: false,
            from_cache: false,
        }
    }

    /// Read a transport response into a payload, enforcing `max_body_size`.
    pub(crate) async fn from_transport(
        response: Response<ResponseBody>,
        max_body_size: usize,
        cached: bool,
    ) -> Result<Self, ApiError> {
        let (parts, body) = response.into_parts();
        let body = read_body_limited(body, max_body_size).await?;
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
            cached,
            from_cache: false,
        })
    }

    /// Synthesize a `200 OK` payload from a cached value.
    ///
    /// Entries stored from a non-JSON body are served as their raw text,
    /// anything else as JSON.
    pub(crate) fn from_cache_value(value: &Value, text: bool) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let body = match value {
            Value::String(text_body) if text => {
                headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                Bytes::from(text_body.clone())
            }
            other => {
                headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Bytes::from(serde_json::to_vec(other)?)
            }
        };
        Ok(Self {
            status: StatusCode::OK,
            headers,
            body,
            cached: true,
            from_cache: true,
        })
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True if the call was eligible for caching.
    #[must_use]
    pub fn cached(&self) -> bool {
        self.cached
    }

    /// True if this payload was served from the cache.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the payload and return the body bytes
    #[must_use]
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Body as UTF-8 text; invalid sequences are replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON into `T`.
    ///
    /// # Errors
    /// Returns `ApiError::Json` if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decoded body: parsed JSON, or the raw text when the body is not JSON.
    #[must_use]
    pub fn value(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| Value::String(self.text()))
    }

    /// Replace the body, keeping status, headers and provenance flags.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Insert or replace one header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Read a (potentially decompressed) body, enforcing the byte limit on
/// decompressed data so a small compressed payload cannot expand unbounded.
///
/// # Errors
/// Returns `ApiError::BodyTooLarge` past the limit and `ApiError::Network`
/// on transport failures while streaming.
pub async fn read_body_limited(body: ResponseBody, limit: usize) -> Result<Bytes, ApiError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ApiError::Network)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(ApiError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
