// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error taxonomy and retry/backoff engine.
//
// Every outgoing IPP call eventually resolves to one of the seven kinds
// below. The reconciler never propagates an `EngineError` out of a scan —
// each failure is folded into registry state plus a timeout.

use std::time::Duration;

use thiserror::Error;

/// The seven error kinds, with the handling policy named in each variant's
/// doc comment.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// IPP timeout, connection refused. Increment retry counter, reschedule.
    #[error("transient remote error")]
    TransientRemote,
    /// Attribute fetch returns a well-formed refusal. Entry -> disappeared.
    #[error("permanent remote error")]
    PermanentRemote,
    /// Queue has active jobs during delete. Disable queue, reschedule.
    #[error("local scheduler busy")]
    SchedulerBusy,
    /// Overwrite detected. Entry -> to-be-released, rename and recreate.
    #[error("external modification detected")]
    ExternalModification,
    /// Unparsable rule, unknown directive. Logged, rule skipped.
    #[error("configuration error")]
    Configuration,
    /// Cannot open the local scheduler even once. Exit non-zero.
    #[error("fatal initialization error")]
    FatalInit,
    /// Allocation failure in discovery intake. Event dropped.
    #[error("resource error")]
    Resource,
}

/// An error raised anywhere in the engine, carrying both its taxonomy kind
/// and a human-readable detail string.
#[derive(Debug, Error)]
#[error("{kind}: {detail}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn transient_remote(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientRemote, detail)
    }

    pub fn permanent_remote(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentRemote, detail)
    }

    pub fn scheduler_busy(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchedulerBusy, detail)
    }

    pub fn external_modification(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalModification, detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, detail)
    }

    pub fn fatal_init(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalInit, detail)
    }

    pub fn resource(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, detail)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted => Self::transient_remote(e.to_string()),
            _ => Self::resource(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Classify a raw IPP status-message/detail string into one of the seven
/// error kinds via substring matching against the common refusal/timeout
/// phrasings a scheduler or remote peer sends back.
pub fn classify_ipp_detail(detail: &str) -> ErrorKind {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("server-error-busy")
        || lower.contains("server-error-service-unavailable")
    {
        return ErrorKind::TransientRemote;
    }

    if lower.contains("client-error-not-possible")
        || lower.contains("client-error-document-format")
        || lower.contains("client-error-not-found")
        || lower.contains("server-error-device-error")
    {
        return ErrorKind::PermanentRemote;
    }

    if lower.contains("client-error-not-authorized") || lower.contains("forbidden") {
        return ErrorKind::Configuration;
    }

    // Unrecognized refusals default to transient — optimistic retry first.
    ErrorKind::TransientRemote
}

/// Backoff configuration for the create/modify retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn from_http_max_retries(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }
}

/// Outcome of evaluating whether an entry should be retried after a
/// transient-remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(ErrorKind),
    Exhausted,
}

/// Decide whether to retry an entry after a failure, keyed on the
/// seven-kind taxonomy above.
pub fn should_retry(err: &EngineError, attempt: u32, config: &RetryConfig) -> RetryDecision {
    match err.kind {
        ErrorKind::TransientRemote | ErrorKind::SchedulerBusy => {
            if attempt >= config.max_retries {
                RetryDecision::Exhausted
            } else {
                RetryDecision::RetryAfter(compute_delay(attempt, config))
            }
        }
        other => RetryDecision::GiveUp(other),
    }
}

/// delay = min(base * 2^attempt + jitter, max_delay).
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter_ms = jitter(base_ms, attempt);
    let total_ms = exp_ms.saturating_add(jitter_ms);
    let capped_ms = total_ms.min(config.max_delay.as_millis() as u64);
    Duration::from_millis(capped_ms)
}

/// Deterministic jitter: multiply the attempt by a large prime and reduce
/// modulo the base delay, spreading retries without a `rand` dependency.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_detail_is_transient_remote() {
        assert_eq!(classify_ipp_detail("request timed out"), ErrorKind::TransientRemote);
    }

    #[test]
    fn document_format_refusal_is_permanent_remote() {
        assert_eq!(
            classify_ipp_detail("client-error-document-format-not-supported"),
            ErrorKind::PermanentRemote
        );
    }

    #[test]
    fn not_authorized_is_configuration() {
        assert_eq!(classify_ipp_detail("client-error-not-authorized"), ErrorKind::Configuration);
    }

    #[test]
    fn retry_respects_max_attempts() {
        let config = RetryConfig::from_http_max_retries(3, Duration::from_secs(1), Duration::from_secs(60));
        let err = EngineError::transient_remote("connection refused");
        assert!(matches!(should_retry(&err, 0, &config), RetryDecision::RetryAfter(_)));
        assert_eq!(should_retry(&err, 3, &config), RetryDecision::Exhausted);
    }

    #[test]
    fn permanent_remote_never_retries() {
        let config = RetryConfig::from_http_max_retries(5, Duration::from_secs(1), Duration::from_secs(60));
        let err = EngineError::permanent_remote("not found");
        assert_eq!(
            should_retry(&err, 0, &config),
            RetryDecision::GiveUp(ErrorKind::PermanentRemote)
        );
    }

    #[test]
    fn delay_increases_with_attempt_and_is_capped() {
        let config = RetryConfig::from_http_max_retries(10, Duration::from_secs(1), Duration::from_secs(5));
        let d0 = compute_delay(0, &config);
        let d1 = compute_delay(1, &config);
        assert!(d1 > d0);
        assert!(compute_delay(8, &config) <= Duration::from_secs(5));
    }
}
