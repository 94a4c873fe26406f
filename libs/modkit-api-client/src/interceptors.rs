//! Request, response and error interceptor chains.
//!
//! Each chain runs its interceptors in registration order, feeding the output
//! of one into the next. Plain closures implement the traits directly; give
//! fallible closures an explicit return type:
//!
//! ```ignore
//! client.interceptors().request.add(|mut config: RequestConfig| -> Result<_, ApiError> {
//!     config.set_header("authorization", "Bearer token")?;
//!     Ok(config)
//! });
//! client.interceptors().error.add(|err: ApiError| err.intercepted("billing API failed"));
//! ```

use crate::error::ApiError;
use crate::request::RequestConfig;
use crate::response::ResponsePayload;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transforms the outgoing request configuration.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// # Errors
    /// An error aborts the call and goes through the error chain.
    async fn on_request(&self, config: RequestConfig) -> Result<RequestConfig, ApiError>;
}

/// Transforms a response payload, including payloads served from cache.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    /// # Errors
    /// An error aborts the call and goes through the error chain.
    async fn on_response(&self, response: ResponsePayload) -> Result<ResponsePayload, ApiError>;
}

/// Observes or replaces a failure before it reaches the caller.
#[async_trait]
pub trait ErrorInterceptor: Send + Sync {
    async fn on_error(&self, error: ApiError) -> ApiError;
}

#[async_trait]
impl<F> RequestInterceptor for F
where
    F: Fn(RequestConfig) -> Result<RequestConfig, ApiError> + Send + Sync,
{
    async fn on_request(&self, config: RequestConfig) -> Result<RequestConfig, ApiError> {
        self(config)
    }
}

#[async_trait]
impl<F> ResponseInterceptor for F
where
    F: Fn(ResponsePayload) -> Result<ResponsePayload, ApiError> + Send + Sync,
{
    async fn on_response(&self, response: ResponsePayload) -> Result<ResponsePayload, ApiError> {
        self(response)
    }
}

#[async_trait]
impl<F> ErrorInterceptor for F
where
    F: Fn(ApiError) -> ApiError + Send + Sync,
{
    async fn on_error(&self, error: ApiError) -> ApiError {
        self(error)
    }
}

/// Handle returned by `add`, used to remove the interceptor again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

impl InterceptorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        InterceptorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One ordered interceptor chain.
pub struct InterceptorChain<T: ?Sized> {
    entries: RwLock<Vec<(InterceptorId, Arc<T>)>>,
}

impl<T: ?Sized> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> InterceptorChain<T> {
    fn push(&self, interceptor: Arc<T>) -> InterceptorId {
        let id = InterceptorId::next();
        self.entries.write().push((id, interceptor));
        id
    }

    /// Remove an interceptor; returns whether it was registered.
    pub fn remove(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current interceptors in order; the lock is released before any of them runs.
    fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect()
    }
}

impl<T: ?Sized> fmt::Debug for InterceptorChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.len())
            .finish()
    }
}

impl InterceptorChain<dyn RequestInterceptor> {
    /// Append an interceptor to the end of the chain.
    pub fn add(&self, interceptor: impl RequestInterceptor + 'static) -> InterceptorId {
        self.push(Arc::new(interceptor))
    }
}

impl InterceptorChain<dyn ResponseInterceptor> {
    /// Append an interceptor to the end of the chain.
    pub fn add(&self, interceptor: impl ResponseInterceptor + 'static) -> InterceptorId {
        self.push(Arc::new(interceptor))
    }
}

impl InterceptorChain<dyn ErrorInterceptor> {
    /// Append an interceptor to the end of the chain.
    pub fn add(&self, interceptor: impl ErrorInterceptor + 'static) -> InterceptorId {
        self.push(Arc::new(interceptor))
    }
}

/// The three interceptor chains consulted by HTTP route calls.
#[derive(Debug, Default)]
pub struct InterceptorRegistry {
    pub request: InterceptorChain<dyn RequestInterceptor>,
    pub response: InterceptorChain<dyn ResponseInterceptor>,
    pub error: InterceptorChain<dyn ErrorInterceptor>,
}

impl InterceptorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn apply_request(
        &self,
        mut config: RequestConfig,
    ) -> Result<RequestConfig, ApiError> {
        for interceptor in self.request.snapshot() {
            config = interceptor.on_request(config).await?;
        }
        Ok(config)
    }

    pub(crate) async fn apply_response(
        &self,
        mut response: ResponsePayload,
    ) -> Result<ResponsePayload, ApiError> {
        for interceptor in self.response.snapshot() {
            response = interceptor.on_response(response).await?;
        }
        Ok(response)
    }

    pub(crate) async fn apply_error(&self, mut error: ApiError) -> ApiError {
        for interceptor in self.error.snapshot() {
            error = interceptor.on_error(error).await;
        }
        error
    }
}
