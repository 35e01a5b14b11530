//! Rate-limit aware request dispatch.
//!
//! One logical call runs through:
//!
//! 1. wait on the global latch
//! 2. wait on the route's bucket (routes seen for the first time skip this and get a seed bucket)
//! 3. send through the transport
//! 4. read rate-limit headers: lock the latch on a global 429, update the route bucket otherwise
//! 5. retry rate-limited attempts up to `max_retries`, or map the status to a result
//!
//! Rate-limit rejections never reach the caller unless every attempt was rejected, in which case
//! the call fails with [`DispatchError::RetriesExhausted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::future::{poll_fn, BoxFuture};
use http::{HeaderValue, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

use crate::bucket::{BucketError, TokenBucket, VariableWindowBucket};
use crate::config::{DispatcherConfig, AUDIT_LOG_REASON};
use crate::error::{DispatchError, ErrorBody};
use crate::headers::{millis, RateLimitHeaders};
use crate::latch::GlobalLatch;
use crate::registry::BucketRegistry;
use crate::request::{ApiRequest, ApiResponse, ResponseBody};
use crate::resource::Resource;
use crate::transport::{BoxError, HttpRequest, HttpResponse};

/// How a rate-limited attempt told us when to come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hint {
    /// The latch or the bucket now holds the wait.
    Scheduled,
    /// Nothing usable; back off before retrying.
    Missing,
}

enum Attempt {
    Complete(ApiResponse),
    RateLimited(Hint),
}

/// Sends [`ApiRequest`]s through a transport while honouring Discord's rate limits.
///
/// Clones share the latch, the bucket registry and the live settings.
pub struct Dispatcher<T> {
    transport: T,
    config: DispatcherConfig,
    latch: GlobalLatch,
    registry: BucketRegistry,
    closed: Arc<AtomicBool>,
}

impl<T: Clone> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            latch: self.latch.clone(),
            registry: self.registry.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("latch", &self.latch)
            .field("buckets", &self.registry.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Dispatcher<T> {
    pub fn new(transport: T, config: DispatcherConfig) -> Self {
        let registry = BucketRegistry::new(config.clock().clone());
        Self {
            transport,
            config,
            latch: GlobalLatch::new(),
            registry,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn latch(&self) -> &GlobalLatch {
        &self.latch
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    /// Bucket currently tracking `resource`, if any.
    pub fn bucket_for(&self, resource: &Resource) -> Option<Arc<VariableWindowBucket>> {
        self.registry.get(resource)
    }

    /// Periodically purge idle buckets. Must be called from within a tokio runtime.
    pub fn spawn_gc(&self, interval: Duration, expire_after: Duration) {
        self.registry.spawn_gc(interval, expire_after);
    }

    /// Refuse new calls and fail every call that is waiting on a rate limit.
    ///
    /// Returns how many calls were queued on route buckets.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let pending = self.registry.close();
        self.latch.unlock();
        debug!(pending, "dispatcher closed");
        pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Dispatcher<T>
where
    T: Service<HttpRequest, Response = HttpResponse> + Clone + Send + Sync,
    T::Error: Into<BoxError>,
    T::Future: Send,
{
    /// Perform one logical call, retrying rate-limited attempts.
    pub async fn request(&self, req: ApiRequest) -> Result<ApiResponse, DispatchError> {
        let resource =
            Resource::new(self.config.base_uri(), req.method(), req.path(), req.params())?;
        let max_attempts = self.config.max_retries().get();
        let mut backoff_step = 0;

        for attempt in 1..=max_attempts {
            if self.is_closed() {
                return Err(DispatchError::Closed);
            }
            debug!(attempt, max_attempts, bucket = %resource.bucket_key(), "dispatching request");
            for file in req.attachments() {
                file.rewind().map_err(DispatchError::Rewind)?;
            }

            match self.attempt(&resource, &req).await? {
                Attempt::Complete(response) => return Ok(response),
                Attempt::RateLimited(Hint::Scheduled) => {}
                Attempt::RateLimited(Hint::Missing) => {
                    if attempt < max_attempts {
                        backoff_step += 1;
                        let delay = self.config.backoff().jittered_delay(backoff_step);
                        debug!(
                            bucket = %resource.bucket_key(),
                            delay_ms = delay.as_millis() as u64,
                            "rate limited without timing hints; backing off"
                        );
                        self.config.sleeper().sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            attempts = max_attempts,
            bucket = %resource.bucket_key(),
            "the request failed too many times; giving up"
        );
        Err(DispatchError::RetriesExhausted {
            resource: Box::new(resource),
            attempts: max_attempts,
        })
    }

    async fn attempt(
        &self,
        resource: &Resource,
        req: &ApiRequest,
    ) -> Result<Attempt, DispatchError> {
        self.latch.acquire_with(Some(Box::new(|| log_suspended(None)))).await;
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let (bucket, created) = self.registry.get_or_seed(
            resource,
            self.config.seed_capacity(),
            self.config.seed_window(),
        );
        if !created {
            let key = resource.bucket_key().to_string();
            bucket
                .acquire_with(1, Some(Box::new(move || log_suspended(Some(&key)))))
                .await
                .map_err(|e| match e {
                    BucketError::Closed => DispatchError::Closed,
                    other => DispatchError::Bucket(other),
                })?;
        }
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let response = self.send(resource, req).await?;
        let limits = RateLimitHeaders::parse(&response.headers);
        let HttpResponse { status, headers, body } = response;
        let body = ResponseBody::decode(status, &headers, body);

        if let Some(hint) = self.interpret_rate_limit(resource, &bucket, status, &limits, &body) {
            return Ok(Attempt::RateLimited(hint));
        }

        match status.as_u16() {
            200..=399 => Ok(Attempt::Complete(ApiResponse { status, headers, body })),
            400..=499 => Err(client_error(status, &body)),
            500..=599 => Err(server_error(status, &body)),
            other => Err(DispatchError::UnrecognizedStatus(other)),
        }
    }

    async fn send(
        &self,
        resource: &Resource,
        req: &ApiRequest,
    ) -> Result<HttpResponse, DispatchError> {
        let mut headers = self.config.default_headers().clone();
        if let Some(reason) = req.audit_reason() {
            let value = HeaderValue::from_str(reason)
                .map_err(|_| DispatchError::InvalidHeader { name: AUDIT_LOG_REASON })?;
            headers.insert(AUDIT_LOG_REASON, value);
        }
        let request = HttpRequest {
            method: resource.method().clone(),
            uri: resource.uri().to_string(),
            headers,
            json: req.body().cloned(),
            attachments: req.attachments().to_vec(),
        };

        let mut transport = self.transport.clone();
        poll_fn(|cx| transport.poll_ready(cx))
            .await
            .map_err(|e| DispatchError::Transport(e.into()))?;
        transport.call(request).await.map_err(|e| DispatchError::Transport(e.into()))
    }

    /// Apply the response's rate-limit information. `Some` means the attempt must be retried.
    fn interpret_rate_limit(
        &self,
        resource: &Resource,
        bucket: &VariableWindowBucket,
        status: StatusCode,
        limits: &RateLimitHeaders,
        body: &ResponseBody,
    ) -> Option<Hint> {
        let too_many = status == StatusCode::TOO_MANY_REQUESTS;

        if too_many && (limits.global || body.is_global()) {
            let wait = body.retry_after_millis().and_then(millis).or(limits.retry_after);
            return Some(match wait {
                Some(wait) => {
                    log_reached(None, wait);
                    self.latch.lock(wait);
                    Hint::Scheduled
                }
                None => {
                    warn!("global rate limit reached without a retry_after");
                    Hint::Missing
                }
            });
        }

        let now = Utc::now();
        let mut scheduled = false;
        if let Some(update) = limits.bucket_update(now) {
            bucket.update(update.limit, update.remaining, update.now, update.reset_at);
            scheduled = true;
        } else if too_many {
            let reset_at = limits
                .retry_after
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .and_then(|wait| now.checked_add_signed(wait));
            if let Some(reset_at) = reset_at {
                bucket.update(bucket.capacity(), 0, now, reset_at);
                scheduled = true;
            }
        }

        if scheduled && bucket.is_limiting() {
            let wait = bucket.time_until_reset();
            if too_many {
                log_reached(Some(resource.bucket_key()), wait);
            } else {
                debug!(
                    bucket = %resource.bucket_key(),
                    reset_in_ms = wait.as_millis() as u64,
                    "rate limit starting"
                );
            }
        }

        too_many.then_some(if scheduled { Hint::Scheduled } else { Hint::Missing })
    }
}

fn limit_name(bucket: Option<&str>) -> String {
    match bucket {
        Some(key) => format!("local rate limit for {}", key),
        None => "global rate limit".to_string(),
    }
}

fn log_suspended(bucket: Option<&str>) {
    debug!("a {} is already active, and the call is being suspended", limit_name(bucket));
}

fn log_reached(bucket: Option<&str>, wait: Duration) {
    warn!("a {} has been reached. Try again after {:.3}s", limit_name(bucket), wait.as_secs_f64());
}

fn client_error(status: StatusCode, body: &ResponseBody) -> DispatchError {
    let (code, message) = body.error_details();
    let details = ErrorBody { status, code, message: message.unwrap_or_default() };
    match status {
        StatusCode::BAD_REQUEST => DispatchError::BadRequest(details),
        StatusCode::UNAUTHORIZED => DispatchError::Unauthorized(details),
        StatusCode::FORBIDDEN => DispatchError::Forbidden(details),
        StatusCode::NOT_FOUND => DispatchError::NotFound(details),
        _ => DispatchError::Client(details),
    }
}

/// Message from the body, whether JSON or raw text, else the status phrase.
fn server_error(status: StatusCode, body: &ResponseBody) -> DispatchError {
    let message = body.error_details().1.filter(|m| !m.trim().is_empty()).unwrap_or_else(|| {
        status.canonical_reason().unwrap_or("Server Error").to_string()
    });
    DispatchError::Server { status, message }
}

impl<T> Service<ApiRequest> for Dispatcher<T>
where
    T: Service<HttpRequest, Response = HttpResponse> + Clone + Send + Sync + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send,
{
    type Response = ApiResponse;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<ApiResponse, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            Poll::Ready(Err(DispatchError::Closed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.request(req).await })
    }
}

/// Wraps a transport into a [`Dispatcher`].
///
/// Each wrapped transport gets its own latch and bucket registry.
#[derive(Debug, Clone)]
pub struct DispatchLayer {
    config: DispatcherConfig,
}

impl DispatchLayer {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }
}

impl<T> Layer<T> for DispatchLayer {
    type Service = Dispatcher<T>;

    fn layer(&self, transport: T) -> Self::Service {
        Dispatcher::new(transport, self.config.clone())
    }
}
