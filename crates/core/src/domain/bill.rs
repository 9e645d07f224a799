use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillId(pub i64);

/// An invoice issued by the payment provider.
///
/// `external_subscription_id` references the provider's subscription id rather
/// than a local row, so a bill may land before its subscription does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    pub external_id: String,
    pub external_subscription_id: Option<String>,
    pub customer_id: Option<CustomerId>,
    pub product_name: Option<String>,
    pub amount: Option<Decimal>,
    pub status: Option<BillStatus>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    Paid,
    Canceled,
    Review,
    Scheduled,
    Open,
    Void,
    Other(String),
}

impl BillStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Canceled => "canceled",
            Self::Review => "review",
            Self::Scheduled => "scheduled",
            Self::Open => "open",
            Self::Void => "void",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "paid" => Self::Paid,
            "canceled" | "cancelled" => Self::Canceled,
            "review" => Self::Review,
            "scheduled" => Self::Scheduled,
            "open" => Self::Open,
            "void" => Self::Void,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}
