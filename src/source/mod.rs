//! # Transaction Sources
//!
//! Boundary between the polling state machine and a concrete bank API.
//! A source pulls raw transaction history for an account and maps it into
//! [`Payment`] values; session handling stays inside the source and is
//! invisible to callers except through [`SourceError::SessionExpired`].

pub mod captcha;
pub mod login;
pub mod mbbank;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::payment::Payment;

/// Failure classes a source can report. The poller treats everything short
/// of `Fatal` as retryable; captcha and login failures retry like transients
/// but are logged and counted separately.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Network blips, timeouts, 5xx replies, malformed bodies.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// The bank rejected the cached session. The source drops it and will
    /// re-authenticate on the next call.
    #[error("bank session expired")]
    SessionExpired,
    /// The captcha resolver produced no usable text.
    #[error("captcha unresolved: {0}")]
    CaptchaUnresolved(String),
    /// The login flow itself was refused (wrong captcha text, bad credentials).
    #[error("login failed: {0}")]
    LoginFailed(String),
    /// Unrecoverable without operator action.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Short label used in logs and per-kind metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::SessionExpired => "session_expired",
            Self::CaptchaUnresolved(_) => "captcha",
            Self::LoginFailed(_) => "login",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Inclusive UTC window for one history pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    /// Window covering the last `day_limit` days, ending now.
    pub fn last_days(day_limit: u32) -> Self {
        let to = Utc::now();
        Self {
            from: to - ChronoDuration::days(i64::from(day_limit)),
            to,
        }
    }
}

/// A pollable bank transaction feed.
#[async_trait::async_trait]
pub trait TransactionSource: Send + Sync {
    /// Pull transaction history for `account` within `window`. Implementations
    /// keep their own session and may authenticate on demand.
    async fn fetch(&self, account: &str, window: FetchWindow) -> Result<Vec<Payment>, SourceError>;

    /// Stable source label for logs ("mbbank", "mock", ...).
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_days_spans_requested_range() {
        let w = FetchWindow::last_days(14);
        let span = w.to - w.from;
        assert_eq!(span, ChronoDuration::days(14));
        assert!(w.from < w.to);
    }

    #[test]
    fn reqwest_errors_classify_as_transient() {
        // Force a reqwest error without touching the network.
        let err = reqwest::Client::new().get("http://[invalid").build().unwrap_err();
        let err: SourceError = err.into();
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn kinds_are_distinct() {
        assert_eq!(SourceError::SessionExpired.kind(), "session_expired");
        assert_eq!(SourceError::CaptchaUnresolved(String::new()).kind(), "captcha");
        assert_eq!(SourceError::LoginFailed(String::new()).kind(), "login");
        assert_eq!(SourceError::Fatal(String::new()).kind(), "fatal");
    }
}
