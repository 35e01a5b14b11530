//! Route identity used for rate-limit bucketing.
//!
//! Discord scopes most limits by route plus a few "major parameters". A [`Resource`] captures the
//! upper-cased method, the path template and the webhook/guild/channel ids of one call; two
//! resources with the same bucket key share one bucket even when their other params differ.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use http::Method;

/// Placeholder used in a bucket key for a major parameter the call does not carry.
const ABSENT: &str = "None";

/// Path params that scope a bucket.
pub const MAJOR_PARAMETERS: [&str; 3] = ["webhook_id", "guild_id", "channel_id"];

/// Named path parameters substituted into a `{name}` template.
pub type Params = BTreeMap<String, String>;

/// Errors raised while building a [`Resource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid http method {0:?}")]
    InvalidMethod(String),
    #[error("path template {template:?} references missing parameter {name:?}")]
    MissingParameter { template: String, name: String },
    #[error("path template {0:?} has an unterminated placeholder")]
    UnterminatedPlaceholder(String),
}

/// One rate-limited endpoint as seen by a single call.
#[derive(Debug, Clone)]
pub struct Resource {
    method: Method,
    path: String,
    uri: String,
    bucket: String,
    params: Params,
}

impl Resource {
    /// Build a resource for `method` on `path` relative to `base_uri`.
    ///
    /// ```rust
    /// use discord_dispatch::{Params, Resource};
    ///
    /// let mut params = Params::new();
    /// params.insert("channel_id".into(), "1234".into());
    /// let base = "https://discord.com/api/v10";
    /// let r = Resource::new(base, "get", "/channels/{channel_id}", &params).unwrap();
    /// assert_eq!(r.uri(), "https://discord.com/api/v10/channels/1234");
    /// assert_eq!(r.bucket_key(), "GET /channels/{channel_id} None None 1234");
    /// ```
    pub fn new(
        base_uri: &str,
        method: &str,
        path: &str,
        params: &Params,
    ) -> Result<Self, ResourceError> {
        let upper = method.to_ascii_uppercase();
        let method = Method::from_bytes(upper.as_bytes())
            .map_err(|_| ResourceError::InvalidMethod(method.to_string()))?;
        let uri = format!("{}{}", base_uri.trim_end_matches('/'), interpolate(path, params)?);

        let scope = |name: &str| params.get(name).map(String::as_str).unwrap_or(ABSENT);
        let bucket = format!(
            "{} {} {} {} {}",
            method,
            path,
            scope(MAJOR_PARAMETERS[0]),
            scope(MAJOR_PARAMETERS[1]),
            scope(MAJOR_PARAMETERS[2]),
        );

        Ok(Self { method, path: path.to_string(), uri, bucket, params: params.clone() })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Unparameterized path template.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fully interpolated request URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Key shared by every call that counts against the same limit.
    pub fn bucket_key(&self) -> &str {
        &self.bucket
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bucket.hash(state);
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.uri)
    }
}

fn interpolate(template: &str, params: &Params) -> Result<String, ResourceError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| ResourceError::UnterminatedPlaceholder(template.to_string()))?;
        let name = &after[..close];
        let value = params.get(name).ok_or_else(|| ResourceError::MissingParameter {
            template: template.to_string(),
            name: name.to_string(),
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
