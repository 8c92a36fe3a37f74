use uuid::Uuid;

use thiserror::Error;

/// Behavioural categories a caller (a scheduled job body or the out-of-scope
/// façade process) needs to distinguish. Each variant carries the context a
/// log line or a retry decision needs — ids, observed/expected state — per
/// the propagation policy: transient failures retried locally, state and
/// validation failures bubble to the caller, one log line per event.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    ValidationFailure(String),
    #[error("bucket {bucket_id} cannot transition from {from} to {to}")]
    InvalidState {
        bucket_id: Uuid,
        from: String,
        to: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("check reservation {reservation_id} exhausted")]
    ResourceExhausted { reservation_id: Uuid },
    #[error("bucket {bucket_id} requires payment before generation")]
    PaymentRequired { bucket_id: Uuid },
    #[error("check assignment failed for bucket {bucket_id}: {reason}")]
    CheckAssignmentFailed { bucket_id: Uuid, reason: String },
    #[error("delivery failed for file {file_history_id}: {reason}")]
    DeliveryFailure {
        file_history_id: Uuid,
        reason: String,
    },
    #[error("configuration missing for payer {payer_id}: {detail}")]
    ConfigurationMissing { payer_id: String, detail: String },
    #[error("critical failure: {0}")]
    Critical(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    /// True for failures a scheduled job should retry on its own cadence
    /// rather than surface as a hard failure to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::DeliveryFailure { .. } | ServiceError::Database(_))
    }
}
