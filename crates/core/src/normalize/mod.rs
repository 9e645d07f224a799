//! Provider payload normalization.
//!
//! Each payment provider posts a differently nested document. A
//! [`PayloadNormalizer`] per provider reduces it to one [`NormalizedRecord`].
//! Normalization is total: missing or malformed fields become `None`, nothing
//! here returns an error.

mod fields;
pub mod stripe;
pub mod vindi;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::event::EventSource;

pub use fields::{parse_amount, parse_timestamp};
pub use stripe::StripeNormalizer;
pub use vindi::VindiNormalizer;

/// Which entity the payload is centered on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    Subscription,
    Bill,
    Charge,
    Customer,
    #[default]
    Empty,
}

/// Funnel stage a provider event type represents for conversion reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    Pending,
    Paid,
}

impl ConversionStage {
    /// Suffix appended to the campaign label before slugging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pendente",
            Self::Paid => "pago",
        }
    }
}

/// Subscription sub-document of a payload, read from the subscription itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFacts {
    pub external_id: String,
    pub status: Option<String>,
    pub product_name: Option<String>,
    pub plan_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Bill sub-document of a payload, read from the bill itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillFacts {
    pub external_id: String,
    pub external_subscription_id: Option<String>,
    pub product_name: Option<String>,
    pub amount: Option<Decimal>,
    pub status: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Flat fields describe the entity named by `shape`. A payload may also carry
/// both a subscription and a bill; each lands in its own facts section so
/// neither is lost to the other.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub shape: PayloadShape,
    pub email: Option<String>,
    pub name: Option<String>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub external_bill_id: Option<String>,
    pub product_name: Option<String>,
    pub plan_name: Option<String>,
    pub amount: Option<Decimal>,
    pub status: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub subscription: Option<SubscriptionFacts>,
    pub bill: Option<BillFacts>,
}

impl NormalizedRecord {
    /// Free text fed to the conversion classifier.
    pub fn classification_text(&self) -> Option<&str> {
        self.product_name.as_deref().or(self.plan_name.as_deref())
    }

    /// Whether the payload carries anything the reconciliation engine can write.
    pub fn is_actionable(&self) -> bool {
        if self.subscription.is_some() || self.bill.is_some() {
            return true;
        }
        matches!(self.shape, PayloadShape::Charge | PayloadShape::Customer) && self.email.is_some()
    }
}

pub trait PayloadNormalizer: Send + Sync {
    fn source(&self) -> EventSource;

    /// Event type as declared inside the payload, when the provider embeds it.
    fn event_type(&self, payload: &Value) -> Option<String>;

    fn normalize(&self, event_type: &str, payload: &Value) -> NormalizedRecord;

    fn conversion_stage(&self, event_type: &str) -> Option<ConversionStage>;
}

static VINDI: VindiNormalizer = VindiNormalizer;
static STRIPE: StripeNormalizer = StripeNormalizer;

pub fn normalizer_for(source: EventSource) -> &'static dyn PayloadNormalizer {
    match source {
        EventSource::Vindi => &VINDI,
        EventSource::Stripe => &STRIPE,
    }
}

pub fn normalize(source: EventSource, event_type: &str, payload: &Value) -> NormalizedRecord {
    normalizer_for(source).normalize(event_type, payload)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{normalize, normalizer_for, PayloadShape};
    use crate::domain::event::EventSource;

    #[test]
    fn dispatch_selects_normalizer_by_declared_source() {
        assert_eq!(normalizer_for(EventSource::Vindi).source(), EventSource::Vindi);
        assert_eq!(normalizer_for(EventSource::Stripe).source(), EventSource::Stripe);
    }

    #[test]
    fn garbage_payloads_degrade_to_empty_records() {
        for payload in [json!(null), json!(42), json!("text"), json!([1, 2]), json!({"event": 7})] {
            let vindi = normalize(EventSource::Vindi, "bill_paid", &payload);
            let stripe = normalize(EventSource::Stripe, "invoice.paid", &payload);

            assert_eq!(vindi.shape, PayloadShape::Empty);
            assert!(!vindi.is_actionable());
            assert_eq!(stripe.shape, PayloadShape::Empty);
            assert!(!stripe.is_actionable());
        }
    }
}
