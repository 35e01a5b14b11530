//! Logical API calls and their decoded results.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::resource::Params;
use crate::transport::Attachment;

/// One logical API call, possibly spanning several attempts.
///
/// ```rust
/// use discord_dispatch::ApiRequest;
///
/// let req = ApiRequest::new("POST", "/channels/{channel_id}/messages")
///     .param("channel_id", "1234")
///     .json(serde_json::json!({ "content": "hi" }))
///     .reason("greeting");
/// assert_eq!(req.params()["channel_id"], "1234");
/// ```
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: String,
    path: String,
    params: Params,
    json: Option<Value>,
    reason: Option<String>,
    attachments: Vec<Attachment>,
}

impl ApiRequest {
    /// `path` is a template such as `/guilds/{guild_id}/members/{user_id}`.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            params: Params::new(),
            json: None,
            reason: None,
            attachments: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    /// Audit log reason sent as `X-Audit-Log-Reason`.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a file; it is rewound before every attempt.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn body(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn audit_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }
}

/// Response body decoded by content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// `text/plain` or `text/html`.
    Text(String),
    Bytes(Vec<u8>),
    /// No content (204 or an empty body).
    Empty,
}

impl ResponseBody {
    pub(crate) fn decode(status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> Self {
        if body.is_empty() || status == StatusCode::NO_CONTENT {
            return Self::Empty;
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match content_type.as_str() {
            "application/json" => match serde_json::from_slice(&body) {
                Ok(value) => Self::Json(value),
                Err(error) => {
                    tracing::warn!(%error, "response claimed to be json but did not parse");
                    Self::Bytes(body)
                }
            },
            "text/plain" | "text/html" => {
                tracing::warn!(
                    content_type = %content_type,
                    status = status.as_u16(),
                    "received a non-json text response. Is Discord down?"
                );
                Self::Text(String::from_utf8_lossy(&body).into_owned())
            }
            _ => Self::Bytes(body),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// `(code, message)` of an error payload. Non-JSON bodies become the message verbatim.
    pub(crate) fn error_details(&self) -> (Option<i64>, Option<String>) {
        match self {
            Self::Json(Value::Object(map)) => (
                map.get("code").and_then(Value::as_i64),
                map.get("message").and_then(Value::as_str).map(str::to_string),
            ),
            Self::Json(other) => (None, Some(other.to_string())),
            Self::Text(text) => (None, Some(text.clone())),
            Self::Bytes(bytes) => (None, Some(String::from_utf8_lossy(bytes).into_owned())),
            Self::Empty => (None, None),
        }
    }

    fn rate_limit(&self) -> Option<RateLimitPayload> {
        RateLimitPayload::deserialize(self.as_json()?).ok()
    }

    /// `retry_after` of a 429 payload, in milliseconds.
    pub(crate) fn retry_after_millis(&self) -> Option<f64> {
        self.rate_limit()?.retry_after.filter(|ms| ms.is_finite() && *ms >= 0.0)
    }

    /// `"global": true` in a 429 payload.
    pub(crate) fn is_global(&self) -> bool {
        self.rate_limit().is_some_and(|payload| payload.global)
    }
}

/// Body of a 429 response.
#[derive(Debug, Deserialize)]
struct RateLimitPayload {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Result of a successful call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}
