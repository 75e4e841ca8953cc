use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Uniform answer for search and availability paths; never names the failing rule.
    #[error("not available for selected dates")]
    NotAvailable,
    #[error("{0}")]
    Validation(String),
    #[error("The reservation details have been altered.")]
    IntegrityViolation,
    #[error("The selected date range is already reserved.")]
    Conflict(Ulid),
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("could not schedule reservation expiry: {0}")]
    Scheduling(String),
    #[error("side store error: {0}")]
    Store(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn listing_not_found(key: impl ToString) -> Self {
        EngineError::NotFound { kind: "listing", key: key.to_string() }
    }

    pub(crate) fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound { kind: "reservation", key: id.to_string() }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}
