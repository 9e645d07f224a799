use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DomainError;

/// Insert-order identifier assigned by the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment provider a webhook was declared to come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Vindi,
    Stripe,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vindi => "vindi",
            Self::Stripe => "stripe",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vindi" => Some(Self::Vindi),
            "stripe" => Some(Self::Stripe),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one event with respect to reconciliation.
///
/// `Pending -> InProgress -> Processed`, with `InProgress -> Pending` when an
/// attempt fails. `Processed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Pending,
    InProgress,
    Processed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Processed => "processed",
        }
    }

    pub fn can_transition_to(&self, next: EventState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Processed)
                | (Self::InProgress, Self::Pending)
        )
    }

    pub fn transition(self, next: EventState) -> Result<EventState, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidEventTransition { from: self, to: next })
        }
    }
}

/// One raw inbound notification as stored in the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: EventId,
    pub source: EventSource,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl BillingEvent {
    pub fn state(&self) -> EventState {
        if self.processed {
            EventState::Processed
        } else {
            EventState::Pending
        }
    }
}

/// An event about to be appended; the log assigns the id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewBillingEvent {
    pub source: EventSource,
    pub event_type: String,
    pub payload: Value,
    pub email: Option<String>,
    pub product_name: Option<String>,
    pub conversion_identifier: Option<String>,
    pub received_at: DateTime<Utc>,
}
