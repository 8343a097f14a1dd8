//! Failures from the chat and embedding endpoints.
//!
//! `is_retryable` drives the retry policy: 429, 408, 5xx and dropped
//! connections are transient. Anything the provider rejects, or a 2xx body
//! we cannot use, is permanent.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The two endpoints the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Chat,
    Embeddings,
}

impl Endpoint {
    /// Path relative to the provider base URL.
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Chat => "chat/completions",
            Endpoint::Embeddings => "embeddings",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. `retry_after` is the provider's `Retry-After`, when sent.
    #[error("{endpoint} rate limited (retry after {retry_after:?})")]
    RateLimited {
        endpoint: Endpoint,
        retry_after: Option<Duration>,
        request_id: Option<String>,
    },

    /// A 4xx the provider will keep returning for this request.
    #[error("{endpoint} rejected the request (HTTP {status}): {message}")]
    Rejected {
        endpoint: Endpoint,
        status: u16,
        /// Provider error code from the body, e.g. "invalid_model".
        code: Option<String>,
        message: String,
        request_id: Option<String>,
    },

    /// 5xx or 408.
    #[error("{endpoint} unavailable (HTTP {status}): {message}")]
    Unavailable {
        endpoint: Endpoint,
        status: u16,
        message: String,
        request_id: Option<String>,
    },

    /// A successful response whose body is unusable: bad JSON, missing
    /// rows, oversize, or an in-band error object.
    #[error("{endpoint} returned an unusable response: {message}")]
    Malformed { endpoint: Endpoint, message: String },

    #[error("model refused: {0}")]
    Refused(String),

    /// Prompt over the input cap; never sent.
    #[error("input too large: {chars} chars (max {max})")]
    InputTooLarge { chars: usize, max: usize },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing API key, bad base URL and the like.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn unavailable(endpoint: Endpoint, status: u16, message: impl Into<String>) -> Self {
        Self::Unavailable {
            endpoint,
            status,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn malformed(endpoint: Endpoint, message: impl Into<String>) -> Self {
        Self::Malformed {
            endpoint,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Rejected { .. }
            | Self::Malformed { .. }
            | Self::Refused(_)
            | Self::InputTooLarge { .. }
            | Self::Config(_) => false,
        }
    }

    /// Short error code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::Unavailable { .. } => "unavailable",
            Self::Malformed { .. } => "malformed_response",
            Self::Refused(_) => "refused",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Provider request id (`x-request-id`), when the failure came from a response.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RateLimited { request_id, .. }
            | Self::Rejected { request_id, .. }
            | Self::Unavailable { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}
