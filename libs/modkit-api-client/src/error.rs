use std::time::Duration;
use thiserror::Error;

/// Boxed source error carried by transport-level variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// API client error types
///
/// Every failure produced while dispatching a route call is one of these
/// variants. Errors raised during the HTTP dispatch sequence pass through the
/// error interceptor chain before reaching the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ApiError {
    /// Invalid or missing base address or route table at construction time
    #[error("Invalid client configuration: {reason}")]
    Configuration { reason: String },

    /// A required `:name` path placeholder had no value in `params`
    #[error("Missing required path parameter '{name}' for route '{path}'")]
    MissingParameter { name: String, path: String },

    /// No transport response arrived before the per-call or default deadline
    #[error("Request timed out after {}", format_elapsed(.0))]
    Timeout(Duration),

    /// The caller-supplied cancellation handle fired before a response arrived
    #[error("Request cancelled by caller")]
    Cancelled,

    /// Transport error (DNS, connection refused, reset, protocol failure)
    #[error("Network error: {0}")]
    Network(#[source] BoxError),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// URL scheme rejected by the transport security mode
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// `send` on a persistent socket address with no live open connection
    #[error("No open connection for '{address}'")]
    ConnectionNotOpen { address: String },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// JSON encoding or decoding failed
    #[error("JSON processing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Request buffer is full; the call was rejected without queueing
    #[error("Service overloaded: request buffer full")]
    Overloaded,

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Error replaced or enriched by an error interceptor
    #[error("{message}")]
    Intercepted {
        message: String,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// Wrap this error with an interceptor-supplied message, keeping it as the source.
    #[must_use]
    pub fn intercepted(self, message: impl Into<String>) -> Self {
        ApiError::Intercepted {
            message: message.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        ApiError::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns the innermost error, looking through interceptor wrappers.
    #[must_use]
    pub fn root(&self) -> &ApiError {
        match self {
            ApiError::Intercepted { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for timeouts and caller cancellation; both abort the transport call.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), ApiError::Timeout(_) | ApiError::Cancelled)
    }

    /// True for failures worth another attempt under a retry directive.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), ApiError::Timeout(_) | ApiError::Network(_))
    }
}

impl From<hyper::Error> for ApiError {
    fn from(err: hyper::Error) -> Self {
        ApiError::Network(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for ApiError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ApiError::Network(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ApiError::Network(Box::new(err))
    }
}

fn format_elapsed(elapsed: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*elapsed)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_timeout_message_names_duration() {
        let err = ApiError::Timeout(Duration::from_millis(1));
        assert_eq!(err.to_string(), "Request timed out after 1ms");

        let err = ApiError::Timeout(Duration::from_micros(250));
        assert_eq!(err.to_string(), "Request timed out after 250us");
    }

    #[test]
    fn test_network_error_preserves_source() {
        let err = ApiError::Network(Box::new(TestError("connection refused")));

        let source = err.source().unwrap();
        let downcast = source.downcast_ref::<TestError>();
        assert_eq!(downcast.unwrap().0, "connection refused");
    }

    #[test]
    fn test_intercepted_keeps_chain() {
        let err = ApiError::Timeout(Duration::from_secs(2)).intercepted("upstream slow");

        assert_eq!(err.to_string(), "upstream slow");
        assert!(err.is_aborted());
        assert!(err.is_retryable());
        assert!(matches!(err.root(), ApiError::Timeout(_)));

        let source = err.source().unwrap();
        assert!(source.to_string().contains("after 2s"));
    }

    #[test]
    fn test_classification() {
        assert!(ApiError::Cancelled.is_aborted());
        assert!(!ApiError::Cancelled.is_retryable());

        let missing = ApiError::MissingParameter {
            name: "id".to_owned(),
            path: "/users/:id".to_owned(),
        };
        assert!(!missing.is_aborted());
        assert!(!missing.is_retryable());
        assert_eq!(
            missing.to_string(),
            "Missing required path parameter 'id' for route '/users/:id'"
        );
    }
}
