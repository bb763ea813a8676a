use std::fmt::Debug;
use std::fmt::Formatter;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;

/// Recursively prints an error together with its full `source()` chain, one
/// cause per line. Used for the `Debug` impl of every error enum so panics
/// and `tracing::error!` output carry the whole chain, not just the leaf.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

/// The error taxonomy of : a kind, not a type hierarchy. Every
/// fallible boundary in the pipeline (queue handler, HTTP handler, resilience
/// wrapper) resolves its failure into one of these before deciding ack / nack
/// / poison / HTTP status.
#[derive(thiserror::Error)]
pub enum CoreError {
    /// Inputs fail shape or semantic validation. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, 5xx, 429, or other network-shaped failure. Retried via the
    /// `Retry` policy and/or queue redelivery.
    #[error("transient error")]
    Transient(#[source] anyhow::Error),

    /// A `CircuitBreaker` refused the call outright. Treated as `Transient`.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// A vendor, email, or blob was looked up and did not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An `UpdateIfMatch` etag mismatch in the KV store.
    #[error("conflict updating {0}")]
    Conflict(String),

    /// An external 429, or the local `RateLimiter`, with an optional
    /// `Retry-After` hint in seconds.
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// A 4xx other than 429 from an outbound call. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Programming error. Propagates; the queue redelivery budget is what
    /// eventually routes the message to poison.
    #[error("fatal error")]
    Fatal(#[source] anyhow::Error),
}

impl Debug for CoreError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl CoreError {
    /// Whether a queue consumer should let this message be redelivered
    /// (`true`) or ack it immediately, whether successfully or as a terminal
    /// failure (`false`). `Fatal` is also non-retryable here: it is expected
    /// to exhaust the queue's redelivery budget and land in poison rather
    /// than being retried indefinitely by application logic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::CircuitOpen(_) | CoreError::RateLimited { .. }
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            CoreError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    /// Whether `worker.rs`'s queue-consumer loop should let a message
    /// redeliver rather than ack it.
    /// Broader than `is_retryable`: a `Fatal` error is never retried
    /// in-process by `Retry`, but the table's own language ("propagate; let
    /// message land in poison queue") means the *queue* should still
    /// redeliver it until `QueueMaxDequeue` is exhausted and `QueueBus`
    /// diverts it to poison, rather than swallowing it as a permanent
    /// business outcome the way `Validation`/`Permanent` are.
    pub fn should_redeliver(&self) -> bool {
        self.is_retryable() || matches!(self, CoreError::Fatal(_))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self { CoreError::Transient(e) }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Permanent(_) => StatusCode::BAD_REQUEST,
            CoreError::CircuitOpen(_) | CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<actix_web::body::BoxBody> {
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}
