use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unknown tenant, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal SDK or backend bug.
    Internal,
}

/// Error codes reported by the contact-center backend in `{error_code, error_message}` bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerErrorCode {
    BadTenantUrl,
    NoAuthHeader,
    AuthHeaderWrongFormat,
    AuthHeaderBadScheme,
    AuthHeaderMissingAppId,
    AuthHeaderMissingClientId,
    AuthHeaderBadAppId,
    ServerTimeout,
    ServerNotAvailable,
    InvalidJson,
    ServerDisconnected,
    SessionNotFound,
    EntryNotFound,
    InternalServerError,
    UploadSizeLimitExceeded,
    FileNotFound,
    TooManyPollRequests,
    NoEvents,
    FileError,
    CaseNotSpecified,
    CrmServerError,
    TooManyParameters,
    UnspecifiedServerError,
}

impl ServerErrorCode {
    /// Look up a backend error code string such as `"5005"`.
    pub fn from_code(code: &str) -> Option<Self> {
        let known = match code.trim() {
            "1000" => Self::BadTenantUrl,
            "2000" => Self::NoAuthHeader,
            "2001" => Self::AuthHeaderWrongFormat,
            "2002" => Self::AuthHeaderBadScheme,
            "2003" => Self::AuthHeaderMissingAppId,
            "2004" => Self::AuthHeaderMissingClientId,
            "3000" => Self::AuthHeaderBadAppId,
            "5000" => Self::ServerTimeout,
            "5001" => Self::ServerNotAvailable,
            "5003" => Self::InvalidJson,
            "5004" => Self::ServerDisconnected,
            "5005" => Self::SessionNotFound,
            "5006" => Self::EntryNotFound,
            "5500" => Self::InternalServerError,
            "5501" => Self::UploadSizeLimitExceeded,
            "5502" => Self::FileNotFound,
            "5509" => Self::TooManyPollRequests,
            "5511" => Self::NoEvents,
            "5558" => Self::FileError,
            "5601" => Self::CaseNotSpecified,
            "5602" => Self::CrmServerError,
            "5603" => Self::TooManyParameters,
            "5955" => Self::UnspecifiedServerError,
            _ => return None,
        };
        Some(known)
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::BadTenantUrl
            | Self::EntryNotFound
            | Self::FileNotFound
            | Self::UploadSizeLimitExceeded
            | Self::CaseNotSpecified
            | Self::TooManyParameters
            | Self::SessionNotFound => ErrorCategory::Config,
            Self::NoAuthHeader
            | Self::AuthHeaderWrongFormat
            | Self::AuthHeaderBadScheme
            | Self::AuthHeaderMissingAppId
            | Self::AuthHeaderMissingClientId
            | Self::AuthHeaderBadAppId => ErrorCategory::Auth,
            Self::ServerTimeout
            | Self::ServerNotAvailable
            | Self::ServerDisconnected
            | Self::NoEvents => ErrorCategory::Network,
            Self::TooManyPollRequests => ErrorCategory::RateLimited,
            Self::InvalidJson => ErrorCategory::Serialization,
            Self::InternalServerError
            | Self::FileError
            | Self::CrmServerError
            | Self::UnspecifiedServerError => ErrorCategory::Internal,
        }
    }
}

/// Errors surfaced by the poll engine and the transport gateway.
///
/// Every variant is `Clone` so deliveries can be fanned out to several subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum ContactCenterError {
    /// The backend does not know the chat session (it ended or never existed).
    #[error("chat session not found")]
    SessionNotFound,
    /// The backend rejected the request with a structured error body.
    #[error("server error {status} ({code:?}): {message}")]
    Server {
        status: u16,
        code: Option<ServerErrorCode>,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Non-success status without a recognizable error body.
    #[error("unexpected status code {status}")]
    BadStatus {
        status: u16,
        retry_after_ms: Option<u64>,
    },
    /// Connection-level failure.
    #[error("network failure: {0}")]
    Network(String),
    /// The request did not finish within the gateway timeout.
    #[error("request timed out")]
    Timeout,
    /// The response could not be interpreted (for example, not an events envelope).
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Every item of a non-empty event batch failed to decode.
    #[error("failed to decode event batch: {}", causes.join("; "))]
    DecodeFailed { causes: Vec<String> },
}

impl ContactCenterError {
    /// Build an error from a backend `{error_code, error_message}` body.
    pub fn from_server(status: u16, error_code: &str, message: impl Into<String>) -> Self {
        match ServerErrorCode::from_code(error_code) {
            Some(ServerErrorCode::SessionNotFound) => Self::SessionNotFound,
            code => Self::Server {
                status,
                code,
                message: message.into(),
                retry_after_ms: None,
            },
        }
    }

    /// Attach a retry hint to errors that can carry one.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        let hint = Some(retry_after.as_millis() as u64);
        match &mut self {
            Self::Server { retry_after_ms, .. } | Self::BadStatus { retry_after_ms, .. } => {
                *retry_after_ms = hint;
            }
            _ => {}
        }
        self
    }

    /// Retry hint in milliseconds, when the backend supplied one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Server { retry_after_ms, .. } | Self::BadStatus { retry_after_ms, .. } => {
                *retry_after_ms
            }
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SessionNotFound => ErrorCategory::Config,
            Self::Server { status, code, .. } => code
                .map(ServerErrorCode::category)
                .unwrap_or_else(|| classify_http_status(*status)),
            Self::BadStatus { status, .. } => classify_http_status(*status),
            Self::Network(_) | Self::Timeout => ErrorCategory::Network,
            Self::UnexpectedResponse(_) | Self::DecodeFailed { .. } => ErrorCategory::Serialization,
            Self::InvalidRequest(_) => ErrorCategory::Config,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::Server { .. } => "server_error",
            Self::BadStatus { .. } => "bad_status_code",
            Self::Network(_) => "network_error",
            Self::Timeout => "timeout",
            Self::UnexpectedResponse(_) => "unexpected_response",
            Self::InvalidRequest(_) => "invalid_request",
            Self::DecodeFailed { .. } => "decode_failed",
        }
    }

    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound)
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}
