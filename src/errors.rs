// src/errors.rs

use thiserror::Error;

/// Error kinds and their propagation policy (see spec §7).
///
/// Every pipeline stage returns `Result<T, IngestError>`; the worker translates
/// these into job state transitions (`retry`, `fail`, `skip`).
#[derive(Debug, Error)]
pub enum IngestError {
    /// Transient network/FTP failure. Retried at the pool; surfaces as a
    /// retriable job failure once per-operation retries are exhausted.
    #[error("transient FTP error: {0}")]
    TransientFtp(String),

    /// The circuit breaker for the FTP host is open. The current job fails
    /// fast and is delayed; the triggering webhook is not marked failed.
    #[error("FTP unavailable: circuit breaker open for {host}")]
    FtpUnavailable { host: String },

    /// Provider JSON could not be reconstructed or parsed into the canonical
    /// record. Record-level skip; does not fail the whole batch.
    #[error("normalization failed for {path}: {reason}")]
    NormalizationFailed { path: String, reason: String },

    /// Schema/shape validation failed on an inbound request or record.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Transactional write conflict or deadlock. Retried up to 3x; persistent
    /// failure splits the batch in half and recurses.
    #[error("database conflict: {0}")]
    DbConflict(String),

    /// A data-model invariant was violated. Fatal at the batch level.
    #[error("schema/invariant violation: {0}")]
    SchemaViolation(String),

    /// Cooperative cancellation observed at a yield point. Non-error terminal
    /// status `skipped`.
    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Whether the worker should retry the job that produced this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IngestError::TransientFtp(_) | IngestError::FtpUnavailable { .. } | IngestError::DbConflict(_)
        )
    }

    /// Whether this error terminates only the current record, not the batch.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            IngestError::NormalizationFailed { .. } | IngestError::ValidationError(_)
        )
    }
}
