use thiserror::Error;

use crate::domain::event::EventState;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid event transition from {from:?} to {to:?}")]
    InvalidEventTransition { from: EventState, to: EventState },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failure taxonomy shared by the reconciliation and delivery paths.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Stable identifier used in structured logs and CLI output.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Persistence(_) => "persistence",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Integration(_) => "integration",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Whether the current batch cycle must stop instead of moving to the next event.
    pub fn aborts_batch(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Configuration(_))
    }
}
