//! Per-call inputs: body, query, params, headers and call directives.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cache parameters of an enabled cache policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheOptions {
    /// Entry lifetime; the client's default TTL applies when absent.
    #[serde(default, with = "crate::humantime_serde::option")]
    pub ttl: Option<Duration>,
    /// Replaces the substituted route path as the base of the cache key.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CachePolicyRepr {
    Flag(bool),
    Options(CacheOptions),
}

/// Cache directive of a route or call.
///
/// In a route table it is written as `true`, `false` or `{ "ttl": ..., "key": ... }`.
/// A call-level policy overrides the route-level one, so `Disabled` on a call
/// turns off caching for a route that enables it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "CachePolicyRepr")]
pub enum CachePolicy {
    Disabled,
    Enabled(CacheOptions),
}

impl From<CachePolicyRepr> for CachePolicy {
    fn from(repr: CachePolicyRepr) -> Self {
        match repr {
            CachePolicyRepr::Flag(false) => CachePolicy::Disabled,
            CachePolicyRepr::Flag(true) => CachePolicy::Enabled(CacheOptions::default()),
            CachePolicyRepr::Options(options) => CachePolicy::Enabled(options),
        }
    }
}

impl CachePolicy {
    /// Enabled with the client's default TTL.
    #[must_use]
    pub fn enabled() -> Self {
        CachePolicy::Enabled(CacheOptions::default())
    }

    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        CachePolicy::Enabled(CacheOptions {
            ttl: Some(ttl),
            key: None,
        })
    }

    /// Override the cache-key base of an enabled policy. No effect on `Disabled`.
    #[must_use]
    pub fn with_key(self, key: impl Into<String>) -> Self {
        match self {
            CachePolicy::Enabled(mut options) => {
                options.key = Some(key.into());
                CachePolicy::Enabled(options)
            }
            CachePolicy::Disabled => CachePolicy::Disabled,
        }
    }

    #[must_use]
    pub fn options(&self) -> Option<&CacheOptions> {
        match self {
            CachePolicy::Enabled(options) => Some(options),
            CachePolicy::Disabled => None,
        }
    }
}

/// Automatic retry: re-run the whole call up to `attempts` times in total,
/// sleeping `delay` between attempts. Only retryable failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDirective {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryDirective {
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Upload progress notification for multipart bodies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    /// `loaded / total * 100`, rounded to two decimals
    pub percent: f64,
}

impl UploadProgress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(loaded: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        Self {
            loaded,
            total,
            percent,
        }
    }
}

/// Callback receiving upload progress notifications.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// A binary file sent as one multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FilePart {
    #[must_use]
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// One named field of a structured body.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Value(Value),
    File(FilePart),
    List(Vec<Field>),
}

impl Field {
    /// True if this field is a file or a list holding a file.
    #[must_use]
    pub fn contains_file(&self) -> bool {
        match self {
            Field::Value(_) => false,
            Field::File(_) => true,
            Field::List(items) => items.iter().any(Field::contains_file),
        }
    }

    /// JSON form of a field without files; file parts render as their file name.
    pub(crate) fn to_json(&self) -> Value {
        match self {
            Field::Value(value) => value.clone(),
            Field::File(file) => Value::String(file.file_name.clone()),
            Field::List(items) => Value::Array(items.iter().map(Field::to_json).collect()),
        }
    }
}

impl From<Value> for Field {
    fn from(value: Value) -> Self {
        Field::Value(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Value(Value::String(value.to_owned()))
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Value(Value::String(value))
    }
}

impl From<FilePart> for Field {
    fn from(file: FilePart) -> Self {
        Field::File(file)
    }
}

impl From<Vec<FilePart>> for Field {
    fn from(files: Vec<FilePart>) -> Self {
        Field::List(files.into_iter().map(Field::File).collect())
    }
}

/// Request body of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Arbitrary JSON document
    Json(Value),
    /// Named fields; sent as multipart when any field holds a file
    Fields(Vec<(String, Field)>),
    /// Pre-encoded bytes, sent as-is
    Raw(Bytes),
}

impl Body {
    /// Start an empty field list.
    #[must_use]
    pub fn fields() -> Self {
        Body::Fields(Vec::new())
    }

    /// Serialize `value` into a JSON body.
    ///
    /// # Errors
    /// Returns `ApiError::Json` if serialization fails.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, crate::ApiError> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }

    /// Append a field. Converts a `Json` object body into fields first;
    /// has no effect on `Raw` bodies.
    #[must_use]
    pub fn field(self, name: impl Into<String>, value: impl Into<Field>) -> Self {
        let mut fields = match self {
            Body::Fields(fields) => fields,
            Body::Json(Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, Field::Value(v)))
                .collect(),
            other => return other,
        };
        fields.push((name.into(), value.into()));
        Body::Fields(fields)
    }

    #[must_use]
    pub fn file(self, name: impl Into<String>, file: FilePart) -> Self {
        self.field(name, Field::File(file))
    }

    /// True if any field is a file, directly or inside a list field.
    #[must_use]
    pub fn has_files(&self) -> bool {
        match self {
            Body::Fields(fields) => fields.iter().any(|(_, field)| field.contains_file()),
            Body::Json(_) | Body::Raw(_) => false,
        }
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// Per-invocation input of a route endpoint.
///
/// Built fresh for every call:
///
/// ```ignore
/// let payload = CallPayload::new()
///     .param("id", 42)
///     .query("expand", "profile")
///     .header("x-request-id", "abc")
///     .cache(CachePolicy::ttl(Duration::from_secs(5)));
/// ```
#[derive(Default)]
#[must_use]
pub struct CallPayload {
    pub(crate) body: Option<Body>,
    pub(crate) query: Map<String, Value>,
    pub(crate) params: Map<String, Value>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryDirective>,
    pub(crate) on_upload_progress: Option<ProgressCallback>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl CallPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    ///
    /// # Errors
    /// Returns `ApiError::Json` if serialization fails.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, crate::ApiError> {
        self.body = Some(Body::json(value)?);
        Ok(self)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Merge every entry of `query` into the query map.
    pub fn query_map(mut self, query: Map<String, Value>) -> Self {
        self.query.extend(query);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Shorthand for `cache(CachePolicy::ttl(ttl))`.
    pub fn cache_ttl(self, ttl: Duration) -> Self {
        self.cache(CachePolicy::ttl(ttl))
    }

    /// Disable caching for this call even if the route enables it.
    pub fn no_cache(self) -> Self {
        self.cache(CachePolicy::Disabled)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryDirective) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn on_upload_progress(
        mut self,
        callback: impl Fn(UploadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_upload_progress = Some(Arc::new(callback));
        self
    }

    /// Abort the call with `ApiError::Cancelled` once `token` is cancelled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for CallPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPayload")
            .field("body", &self.body)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("on_upload_progress", &self.on_upload_progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}
