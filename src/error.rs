// Error taxonomy for the sync core.
//
// Adapters return typed values for expected provider failures; callers
// decide retry behavior from the class, never from message text.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or revoked credentials, insufficient scope. Not retried
    /// automatically; the integration is marked inactive until the user
    /// re-authorizes.
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Provider throttling. Snooze until `retry_after_secs` if the
    /// provider supplied one, otherwise fall back to the job backoff.
    #[error("Rate limited: {reason}")]
    RateLimited {
        reason: String,
        retry_after_secs: Option<u64>,
    },

    /// Network failure, timeout or 5xx. Retry with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Another refresh holds the lock for this integration. Not a
    /// failure; re-read persisted state shortly.
    #[error("Token refresh already in progress")]
    RefreshInProgress,

    /// Bad URL, missing calendar, unusable credentials shape.
    /// User-actionable; not retried automatically.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SyncError {
    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rate_limited<S: Into<String>>(reason: S, retry_after_secs: Option<u64>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
            retry_after_secs,
        }
    }

    /// Classify an HTTP error status from a provider API.
    ///
    /// 403 is ambiguous on both Google and Outlook: quota exhaustion and
    /// missing permissions share the status, so the body is inspected.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => Self::Permanent(format!("unauthorized: {}", truncate_body(body))),
            403 => {
                let lower = body.to_lowercase();
                if lower.contains("ratelimit")
                    || lower.contains("rate limit")
                    || lower.contains("quota")
                {
                    Self::rate_limited(format!("provider quota: {}", truncate_body(body)), None)
                } else {
                    Self::Permanent(format!("insufficient permissions: {}", truncate_body(body)))
                }
            }
            404 => Self::NotFound(truncate_body(body)),
            429 => Self::rate_limited(format!("too many requests: {}", truncate_body(body)), None),
            500..=599 => {
                Self::Transient(format!("server error {}: {}", status, truncate_body(body)))
            }
            _ => Self::Transient(format!("unexpected status {}: {}", status, truncate_body(body))),
        }
    }

    /// Hard errors count against integration health; transient ones are
    /// expected noise. `RefreshInProgress` is neither and should not be
    /// reported at all.
    pub fn is_hard(&self) -> bool {
        match self {
            Self::Permanent(_) | Self::Configuration(_) | Self::NotFound(_) => true,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Database(_) => false,
            Self::RefreshInProgress => false,
        }
    }

    /// Taxonomy label for logs and the integration's `sync_error` field.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Permanent(_) => "permanent",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::RefreshInProgress => "refresh_in_progress",
            Self::Configuration(_) => "configuration",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are transient by definition; whether
        // the peer is down or we timed out, a retry may succeed.
        if err.is_timeout() {
            Self::Transient(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::Transient(format!("connection failed: {}", err))
        } else {
            Self::Transient(format!("request failed: {}", err))
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
