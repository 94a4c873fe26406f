#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Declarative API client for `ModKit`
//!
//! A route table (name → path template, method, headers, cache and
//! invalidation rules) is turned into callable endpoints:
//! - `get`/`post`/`put`/`patch`/`delete` routes go through a buffered
//!   hyper/tower HTTP stack with response caching and interceptors
//! - `websocket` routes share one persistent connection per address
//! - `sse` routes open an independent event stream per call
//!
//! # HTTP call pipeline
//!
//! 1. Request interceptors fold over the merged [`RequestConfig`]
//! 2. Safe reads with a cache policy are served from [`CacheManager`] on a hit
//! 3. Otherwise the request is sent under the call deadline and cancel token
//! 4. Response interceptors fold over the [`ResponsePayload`]
//! 5. Successful responses are cached and the route's `invalidates`
//!    patterns are cleared
//!
//! Any failure goes through the error interceptors before reaching the caller.
//!
//! # Example
//!
//! ```ignore
//! use modkit_api_client::{ApiClient, CallPayload, RouteTable};
//! use std::time::Duration;
//!
//! let routes = RouteTable::from_json_str(r#"{
//!     "listUsers":  { "path": "/users", "method": "get", "cache": { "ttl": "5s" } },
//!     "createUser": { "path": "/users", "method": "post", "invalidates": ["/users"] }
//! }"#)?;
//!
//! let client = ApiClient::builder()
//!     .base_url("https://api.example.com/v1")
//!     .routes(routes)
//!     .build()?;
//!
//! let users: Vec<User> = client.call("listUsers", CallPayload::new()).await?.json()?;
//! client
//!     .call("createUser", CallPayload::new().json(&NewUser { name: "John" })?)
//!     .await?;
//! ```

mod body;
mod builder;
mod cache;
mod client;
mod config;
mod dispatcher;
mod error;
mod humantime_serde;
mod interceptors;
mod payload;
mod request;
mod response;
mod route;
pub mod socket;
pub mod sse;
pub mod transport;
pub mod url;

pub use body::{EncodedBody, UPLOAD_CHUNK_SIZE, UploadBody};
pub use builder::ApiClientBuilder;
pub use cache::CacheManager;
pub use client::ApiClient;
pub use config::{
    ApiClientConfig, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DEFAULT_MAX_BODY_SIZE,
    DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, TlsRootConfig, TransportSecurity,
};
pub use dispatcher::{Endpoint, HttpEndpoint, SocketEndpoint, StreamEndpoint};
pub use error::{ApiError, BoxError};
pub use interceptors::{
    ErrorInterceptor, InterceptorChain, InterceptorId, InterceptorRegistry, RequestInterceptor,
    ResponseInterceptor,
};
pub use payload::{
    Body, CacheOptions, CachePolicy, CallPayload, Field, FilePart, ProgressCallback,
    RetryDirective, UploadProgress,
};
pub use request::RequestConfig;
pub use response::{ResponseBody, ResponsePayload, read_body_limited};
pub use route::{RouteDescriptor, RouteMethod, RouteTable};
pub use socket::{SocketConnection, SocketEvent, SocketEventKind, SocketManager, SocketMessage};
pub use sse::{SseEvent, StreamHandle};
pub use transport::{HttpService, HttpTransport};
