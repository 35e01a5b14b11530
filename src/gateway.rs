//! Gateway-facing pieces that share the rate-limit primitives: close codes, the connection error,
//! and the outbound command limiter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bucket::{BucketError, FixedWindowBucket, TokenBucket};
use crate::clock::{Clock, MonotonicClock};

/// Commands a connection may send per window.
pub const COMMANDS_PER_WINDOW: u32 = 120;
/// Length of the command window.
pub const COMMAND_WINDOW: Duration = Duration::from_secs(60);

/// WebSocket close codes sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCloseCode {
    NormalClosure,
    UnknownError,
    UnknownOpcode,
    DecodeError,
    NotAuthenticated,
    AuthenticationFailed,
    AlreadyAuthenticated,
    InvalidSeq,
    RateLimited,
    SessionTimeout,
    InvalidShard,
    ShardingRequired,
    InvalidVersion,
    InvalidIntents,
    DisallowedIntents,
    /// Any code not listed above.
    Other(u16),
}

impl GatewayCloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::NormalClosure => 1000,
            Self::UnknownError => 4000,
            Self::UnknownOpcode => 4001,
            Self::DecodeError => 4002,
            Self::NotAuthenticated => 4003,
            Self::AuthenticationFailed => 4004,
            Self::AlreadyAuthenticated => 4005,
            Self::InvalidSeq => 4007,
            Self::RateLimited => 4008,
            Self::SessionTimeout => 4009,
            Self::InvalidShard => 4010,
            Self::ShardingRequired => 4011,
            Self::InvalidVersion => 4012,
            Self::InvalidIntents => 4013,
            Self::DisallowedIntents => 4014,
            Self::Other(code) => code,
        }
    }

    /// Whether reconnecting with the same settings can succeed.
    pub fn can_reconnect(self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NormalClosure => "NORMAL_CLOSURE",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::UnknownOpcode => "UNKNOWN_OPCODE",
            Self::DecodeError => "DECODE_ERROR",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            Self::InvalidSeq => "INVALID_SEQ",
            Self::RateLimited => "RATE_LIMITED",
            Self::SessionTimeout => "SESSION_TIMEOUT",
            Self::InvalidShard => "INVALID_SHARD",
            Self::ShardingRequired => "SHARDING_REQUIRED",
            Self::InvalidVersion => "INVALID_VERSION",
            Self::InvalidIntents => "INVALID_INTENTS",
            Self::DisallowedIntents => "DISALLOWED_INTENTS",
            Self::Other(_) => return None,
        })
    }
}

impl From<u16> for GatewayCloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::NormalClosure,
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSeq,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimeout,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for GatewayCloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.code()),
            None => write!(f, "{}", self.code()),
        }
    }
}

/// Failure of a gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("The gateway client has been closed")]
    ClientClosed,
    #[error("{}", closed_message(*code, reason.as_deref()))]
    ConnectionClosed { code: GatewayCloseCode, reason: Option<String> },
}

fn closed_message(code: GatewayCloseCode, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => reason.to_string(),
        None => format!("Gateway connection closed by server with code {}", code),
    }
}

impl GatewayError {
    pub fn connection_closed(code: u16, reason: Option<String>) -> Self {
        Self::ConnectionClosed { code: code.into(), reason }
    }

    pub fn close_code(&self) -> Option<GatewayCloseCode> {
        match self {
            Self::ConnectionClosed { code, .. } => Some(*code),
            Self::ClientClosed => None,
        }
    }
}

/// Outbound command limiter for one gateway connection.
#[derive(Debug)]
pub struct GatewayCommandLimiter {
    bucket: FixedWindowBucket,
}

impl Default for GatewayCommandLimiter {
    fn default() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }
}

impl GatewayCommandLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { bucket: FixedWindowBucket::with_clock(COMMANDS_PER_WINDOW, COMMAND_WINDOW, clock) }
    }

    /// Wait for a send slot.
    pub async fn acquire(&self) -> Result<(), BucketError> {
        self.bucket
            .acquire_with(
                1,
                Some(Box::new(|| {
                    tracing::warn!(
                        limit = COMMANDS_PER_WINDOW,
                        "gateway command rate limit reached; delaying send"
                    )
                })),
            )
            .await
    }

    pub fn remaining(&self) -> u32 {
        self.bucket.remaining()
    }

    /// Reject every send that is still waiting, e.g. when the connection drops.
    pub fn close(&self) -> usize {
        self.bucket.close()
    }
}
