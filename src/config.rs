//! Dispatcher configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use discord_dispatch::DispatcherConfig;
//!
//! let config = DispatcherConfig::builder()
//!     .token("abc.def.ghi")
//!     .max_retries(3)
//!     .seed_bucket(5, Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_retries().get(), 3);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderValue};

use crate::adaptive::DynamicConfig;
use crate::backoff::Backoff;
use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};

pub const DEFAULT_BASE_URI: &str = "https://discord.com/api/v10";
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_SEED_CAPACITY: u32 = 10;
pub const DEFAULT_SEED_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_PRECISION: &str = "x-ratelimit-precision";
pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Errors produced while building a [`DispatcherConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_retries` must be > 0.
    InvalidMaxRetries(usize),
    /// Seed buckets need at least one slot.
    InvalidSeedCapacity,
    /// Seed buckets need a non-zero window.
    InvalidSeedWindow,
    /// A default header could not be encoded.
    InvalidHeader(&'static str),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidMaxRetries(n) => write!(f, "max_retries must be > 0 (got {})", n),
            BuildError::InvalidSeedCapacity => write!(f, "seed bucket capacity must be > 0"),
            BuildError::InvalidSeedWindow => write!(f, "seed bucket window must be > 0"),
            BuildError::InvalidHeader(name) => write!(f, "invalid value for header {}", name),
        }
    }
}

impl std::error::Error for BuildError {}

/// Validated settings shared by a dispatcher and its clones.
#[derive(Clone)]
pub struct DispatcherConfig {
    base_uri: String,
    default_headers: HeaderMap,
    max_retries: DynamicConfig<usize>,
    seed_capacity: u32,
    seed_window: Duration,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("base_uri", &self.base_uri)
            .field("max_retries", &self.max_retries.get())
            .field("seed_capacity", &self.seed_capacity)
            .field("seed_window", &self.seed_window)
            .field("backoff", &self.backoff)
            .field("sleeper", &self.sleeper)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::new()
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Headers sent with every attempt.
    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    /// Live handle; changes apply to requests started afterwards.
    pub fn max_retries(&self) -> &DynamicConfig<usize> {
        &self.max_retries
    }

    pub fn seed_capacity(&self) -> u32 {
        self.seed_capacity
    }

    pub fn seed_window(&self) -> Duration {
        self.seed_window
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// Builder for [`DispatcherConfig`].
pub struct DispatcherConfigBuilder {
    token: Option<String>,
    base_uri: String,
    user_agent: Option<String>,
    max_retries: usize,
    seed_capacity: u32,
    seed_window: Duration,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfigBuilder {
    pub fn new() -> Self {
        Self {
            token: None,
            base_uri: DEFAULT_BASE_URI.to_string(),
            user_agent: None,
            max_retries: DEFAULT_MAX_RETRIES,
            seed_capacity: DEFAULT_SEED_CAPACITY,
            seed_window: DEFAULT_SEED_WINDOW,
            backoff: Backoff::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: None,
        }
    }

    /// Bot tokens contain dots and are sent as `Bot <token>`; anything else is an OAuth2 bearer.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.base_uri = uri.into();
        self
    }

    /// Override the `User-Agent` header.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Total attempts per request before giving up on rate limits. Must be > 0.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Parameters assumed for a route before its first response arrives.
    pub fn seed_bucket(mut self, capacity: u32, window: Duration) -> Self {
        self.seed_capacity = capacity;
        self.seed_window = window;
        self
    }

    /// Delay policy for 429s without timing hints.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> Result<DispatcherConfig, BuildError> {
        if self.max_retries == 0 {
            return Err(BuildError::InvalidMaxRetries(0));
        }
        if self.seed_capacity == 0 {
            return Err(BuildError::InvalidSeedCapacity);
        }
        if self.seed_window.is_zero() {
            return Err(BuildError::InvalidSeedWindow);
        }

        let user_agent = self.user_agent.unwrap_or_else(default_user_agent);
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent)
                .map_err(|_| BuildError::InvalidHeader("user-agent"))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(RATE_LIMIT_PRECISION, HeaderValue::from_static("millisecond"));
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(&authorization(token))
                .map_err(|_| BuildError::InvalidHeader("authorization"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(DispatcherConfig {
            base_uri: self.base_uri,
            default_headers: headers,
            max_retries: DynamicConfig::new(self.max_retries),
            seed_capacity: self.seed_capacity,
            seed_window: self.seed_window,
            backoff: self.backoff,
            sleeper: self.sleeper,
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default())),
        })
    }
}

fn authorization(token: &str) -> String {
    if token.contains('.') {
        format!("Bot {}", token)
    } else {
        format!("Bearer {}", token)
    }
}

fn default_user_agent() -> String {
    format!("DiscordBot ({}, {})", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
