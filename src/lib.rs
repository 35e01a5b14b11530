#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # discord-dispatch
//!
//! Rate-limit aware request dispatch for the Discord HTTP API.
//!
//! ## Features
//!
//! - **Route buckets** that follow the `X-RateLimit-*` headers of every response
//! - **Global latch** that suspends every call while an account-wide limit is active
//! - **Retries** of rate-limited attempts with a live, adjustable ceiling
//! - **Typed errors** for client, server and exhausted-retry failures
//! - **Gateway command limiter** built on the same fixed-window bucket
//! - **Transport agnostic**: any `tower` service that sends an [`HttpRequest`]
//!
//! ## Quick Start
//!
//! ```rust
//! use discord_dispatch::{
//!     ApiRequest, Dispatcher, DispatcherConfig, HttpRequest, HttpResponse,
//! };
//! use http::StatusCode;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let transport = tower::service_fn(|_req: HttpRequest| async {
//!         Ok::<_, std::io::Error>(HttpResponse::new(StatusCode::NO_CONTENT))
//!     });
//!     let config = DispatcherConfig::builder().token("abc.def.ghi").build().unwrap();
//!     let dispatcher = Dispatcher::new(transport, config);
//!
//!     let response = dispatcher
//!         .request(ApiRequest::new("DELETE", "/channels/{channel_id}").param("channel_id", 42))
//!         .await
//!         .unwrap();
//!     assert_eq!(response.status, StatusCode::NO_CONTENT);
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod latch;
pub mod registry;
pub mod request;
pub mod resource;
pub mod sleeper;
pub mod transport;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffError};
pub use bucket::{BucketError, FixedWindowBucket, OnLimited, TokenBucket, VariableWindowBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BuildError, DispatcherConfig, DispatcherConfigBuilder};
pub use dispatcher::{DispatchLayer, Dispatcher};
pub use error::{DispatchError, ErrorBody};
pub use gateway::{GatewayCloseCode, GatewayCommandLimiter, GatewayError};
pub use headers::RateLimitHeaders;
pub use latch::GlobalLatch;
pub use registry::BucketRegistry;
pub use request::{ApiRequest, ApiResponse, ResponseBody};
pub use resource::{Params, Resource, ResourceError};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{Attachment, BoxError, HttpRequest, HttpResponse};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
