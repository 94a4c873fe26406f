//! Buffered HTTP transport.
//!
//! Request flow (outer to inner):
//!   Buffer → `UserAgent` → Decompression → hyper client
//!
//! Deadlines, cancellation and retries are owned by the dispatcher, one level
//! up, so that a retry re-runs the interceptor chain as well. The service here
//! returns `Ok(Response)` for every HTTP status and `Err` only for transport
//! failures.

pub mod tls;
mod user_agent;

pub use user_agent::{UserAgentLayer, UserAgentService};

use crate::body::UploadBody;
use crate::config::{TlsRootConfig, TransportSecurity};
use crate::error::ApiError;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use tower::buffer::Buffer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Type-erased HTTP service; inject one through the client builder to replace
/// the hyper stack (tests, custom middleware).
pub type HttpService = BoxCloneService<Request<UploadBody>, Response<ResponseBody>, ApiError>;

type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, ApiError>> + Send>>;

pub(crate) type BufferedService = Buffer<Request<UploadBody>, ServiceFuture>;

/// Cheaply cloneable handle to the buffered HTTP service.
#[derive(Clone)]
pub struct HttpTransport {
    service: BufferedService,
}

impl HttpTransport {
    /// Default stack over a pooled hyper client with rustls.
    ///
    /// Must be called inside a tokio runtime: the buffer spawns its worker task.
    ///
    /// # Errors
    /// Returns `ApiError::Tls` or `ApiError::InvalidHeaderValue` (user agent).
    pub fn hyper(
        user_agent: &str,
        tls_roots: TlsRootConfig,
        transport: TransportSecurity,
        buffer_capacity: usize,
    ) -> Result<Self, ApiError> {
        let https = tls::https_connector(tls_roots, transport)?;
        let hyper_client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build::<_, UploadBody>(https);

        let service = ServiceBuilder::new()
            .layer(UserAgentLayer::try_new(user_agent)?)
            .layer(DecompressionLayer::new())
            .service(hyper_client)
            .map_response(map_decompression_response)
            .map_err(ApiError::from);

        Ok(Self::from_service(service.boxed_clone(), buffer_capacity))
    }

    /// Wrap an arbitrary service in the request buffer.
    ///
    /// Must be called inside a tokio runtime. A capacity of 0 is clamped to 1.
    #[must_use]
    pub fn from_service(service: HttpService, buffer_capacity: usize) -> Self {
        Self {
            service: Buffer::new(service, buffer_capacity.max(1)),
        }
    }

    /// Send one request.
    ///
    /// # Errors
    /// Returns `ApiError::Overloaded` when the buffer is full, `ApiError::ServiceClosed`
    /// if the buffer worker died, and whatever the inner service fails with.
    pub async fn send(&self, request: Request<UploadBody>) -> Result<Response<ResponseBody>, ApiError> {
        let mut service = self.service.clone();
        try_acquire_buffer_slot(&mut service).await?;
        service.call(request).await.map_err(map_buffer_error)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

/// Box the decompression body into [`ResponseBody`].
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

/// Buffer wraps inner failures in a `BoxError`; unwrap our own error or
/// report the worker as gone.
fn map_buffer_error(err: tower::BoxError) -> ApiError {
    match err.downcast::<ApiError>() {
        Ok(api_err) => *api_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            ApiError::ServiceClosed
        }
    }
}

/// Poll the buffer once; a full buffer fails fast with `Overloaded`.
async fn try_acquire_buffer_slot(service: &mut BufferedService) -> Result<(), ApiError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(ApiError::Overloaded),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::Full;

    fn ok_service() -> HttpService {
        tower::service_fn(|req: Request<UploadBody>| async move {
            let body: ResponseBody = Full::new(Bytes::from(req.uri().path().to_owned()))
                .map_err(|never| match never {})
                .boxed();
            Ok::<_, ApiError>(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(body)
                    .unwrap(),
            )
        })
        .boxed_clone()
    }

    #[tokio::test]
    async fn test_injected_service_round_trip() {
        let transport = HttpTransport::from_service(ok_service(), 8);
        let request = Request::builder()
            .uri("https://api.example.com/ping")
            .body(UploadBody::empty())
            .unwrap();

        let response = transport.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = crate::response::read_body_limited(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"/ping"));
    }

    #[tokio::test]
    async fn test_inner_error_preserved_through_buffer() {
        let failing: HttpService = tower::service_fn(|_req: Request<UploadBody>| async {
            Err::<Response<ResponseBody>, _>(ApiError::Network("connection refused".into()))
        })
        .boxed_clone();
        let transport = HttpTransport::from_service(failing, 8);

        let err = transport
            .send(
                Request::builder()
                    .uri("https://api.example.com/")
                    .body(UploadBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
    }

    #[tokio::test]
    async fn test_hyper_stack_builds() {
        let transport = HttpTransport::hyper(
            crate::config::DEFAULT_USER_AGENT,
            TlsRootConfig::WebPki,
            TransportSecurity::TlsOnly,
            0,
        );
        assert!(transport.is_ok());
    }
}
