use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use billsync_core::domain::bill::{Bill, BillId};
use billsync_core::domain::customer::{Customer, CustomerId};
use billsync_core::domain::event::{BillingEvent, EventId, NewBillingEvent};
use billsync_core::domain::subscription::{Subscription, SubscriptionId};
use billsync_core::errors::ApplicationError;
use billsync_core::reconcile::ReconciliationPlan;

pub mod entities;
pub mod event_log;
pub mod memory;

pub use entities::SqlEntityStore;
pub use event_log::SqlEventLogRepository;
pub use memory::InMemoryBillingStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("event {0} does not exist")]
    UnknownEvent(EventId),
    #[error("event {0} was already processed")]
    AlreadyProcessed(EventId),
}

impl RepositoryError {
    /// True when storage as a whole is unreachable, as opposed to one
    /// statement failing.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Database(error) => matches!(
                error,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Configuration(_)
            ),
            Self::Decode(_) | Self::UnknownEvent(_) | Self::AlreadyProcessed(_) => false,
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        if error.is_unavailable() {
            ApplicationError::StorageUnavailable(error.to_string())
        } else {
            ApplicationError::Persistence(error.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub pending: u64,
    pub processed: u64,
    /// Pending events that already failed at least once.
    pub failing: u64,
}

/// Row ids touched by one applied plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppliedPlan {
    pub customer_id: Option<CustomerId>,
    pub subscription_id: Option<SubscriptionId>,
    pub bill_id: Option<BillId>,
}

/// Append-only log of inbound provider notifications.
#[async_trait]
pub trait EventLogRepository: Send + Sync {
    async fn append(&self, event: NewBillingEvent) -> Result<EventId, RepositoryError>;

    async fn find(&self, id: EventId) -> Result<Option<BillingEvent>, RepositoryError>;

    /// Up to `limit` unprocessed events, oldest id first.
    async fn list_pending(&self, limit: u32) -> Result<Vec<BillingEvent>, RepositoryError>;

    /// Bumps the attempt counter and stores the error. Never touches `processed`.
    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), RepositoryError>;

    async fn counts(&self) -> Result<EventCounts, RepositoryError>;
}

/// Customer, subscription and bill storage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Applies every upsert in `plan` and marks `event_id` processed, all in
    /// one atomic unit. A failure leaves both entities and event untouched.
    /// An event that is already processed fails with `AlreadyProcessed` and
    /// writes nothing.
    async fn apply(
        &self,
        event_id: EventId,
        plan: &ReconciliationPlan,
        processed_at: DateTime<Utc>,
    ) -> Result<AppliedPlan, RepositoryError>;

    async fn find_customer_by_email(&self, email: &str)
        -> Result<Option<Customer>, RepositoryError>;

    async fn find_subscription(
        &self,
        external_id: &str,
    ) -> Result<Option<Subscription>, RepositoryError>;

    async fn find_bill(&self, external_id: &str) -> Result<Option<Bill>, RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value
        .map(|raw| {
            Decimal::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid decimal in `{column}`: `{raw}` ({error})"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use billsync_core::domain::event::EventId;
    use billsync_core::errors::ApplicationError;

    use super::RepositoryError;

    #[test]
    fn pool_loss_maps_to_storage_unavailable() {
        let error = ApplicationError::from(RepositoryError::Database(sqlx::Error::PoolClosed));
        assert_eq!(error.error_class(), "storage_unavailable");
        assert!(error.aborts_batch());
    }

    #[test]
    fn row_level_failures_stay_per_event() {
        let error = ApplicationError::from(RepositoryError::UnknownEvent(EventId(3)));
        assert_eq!(error.error_class(), "persistence");
        assert!(!error.aborts_batch());

        let decode = RepositoryError::Decode("bad timestamp".to_string());
        assert!(!decode.is_unavailable());
    }
}
