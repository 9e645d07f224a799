use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub i64);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub external_id: String,
    pub customer_id: Option<CustomerId>,
    pub product_name: Option<String>,
    pub plan_name: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Future,
    Expired,
    PastDue,
    Trialing,
    Other(String),
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Future => "future",
            Self::Expired => "expired",
            Self::PastDue => "past_due",
            Self::Trialing => "trialing",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "canceled" | "cancelled" => Self::Canceled,
            "future" => Self::Future,
            "expired" => Self::Expired,
            "past_due" => Self::PastDue,
            "trialing" => Self::Trialing,
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionStatus;

    #[test]
    fn british_spelling_maps_to_canceled() {
        assert_eq!(SubscriptionStatus::parse("Cancelled"), SubscriptionStatus::Canceled);
    }

    #[test]
    fn unknown_status_is_preserved_verbatim() {
        let status = SubscriptionStatus::parse("incomplete_expired");
        assert_eq!(status.as_str(), "incomplete_expired");
    }
}
