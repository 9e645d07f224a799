//! Stripe event envelopes: `{"type", "created", "data": {"object": {...}}}`,
//! with the object kind in `data.object.object`, unix-second timestamps and
//! amounts in minor units.

use serde_json::Value;

use super::fields::{first_text, minor_units_at, text_at, unix_at};
use super::{
    BillFacts, ConversionStage, NormalizedRecord, PayloadNormalizer, PayloadShape,
    SubscriptionFacts,
};
use crate::domain::event::EventSource;

#[derive(Clone, Copy, Debug, Default)]
pub struct StripeNormalizer;

impl PayloadNormalizer for StripeNormalizer {
    fn source(&self) -> EventSource {
        EventSource::Stripe
    }

    fn event_type(&self, payload: &Value) -> Option<String> {
        text_at(payload, "/type")
    }

    fn normalize(&self, _event_type: &str, payload: &Value) -> NormalizedRecord {
        let object = payload.pointer("/data/object").unwrap_or(&Value::Null);
        let shape = match text_at(object, "/object").as_deref() {
            Some("subscription") => PayloadShape::Subscription,
            Some("invoice") => PayloadShape::Bill,
            Some("charge") => PayloadShape::Charge,
            Some("customer") => PayloadShape::Customer,
            _ => PayloadShape::Empty,
        };

        let mut record = match shape {
            PayloadShape::Subscription => NormalizedRecord {
                shape,
                external_customer_id: text_at(object, "/customer"),
                external_subscription_id: text_at(object, "/id"),
                product_name: text_at(object, "/items/data/0/price/product/name"),
                plan_name: first_text(
                    object,
                    &["/items/data/0/price/nickname", "/items/data/0/plan/nickname", "/plan/nickname"],
                ),
                amount: minor_units_at(object, "/items/data/0/price/unit_amount"),
                status: text_at(object, "/status"),
                created_at: unix_at(object, "/created"),
                ..NormalizedRecord::default()
            },
            PayloadShape::Bill => NormalizedRecord {
                shape,
                email: text_at(object, "/customer_email"),
                name: text_at(object, "/customer_name"),
                external_customer_id: text_at(object, "/customer"),
                external_subscription_id: text_at(object, "/subscription"),
                external_bill_id: text_at(object, "/id"),
                product_name: first_text(
                    object,
                    &["/lines/data/0/description", "/lines/data/0/price/nickname"],
                ),
                amount: minor_units_at(object, "/amount_due"),
                status: text_at(object, "/status"),
                due_at: unix_at(object, "/due_date"),
                created_at: unix_at(object, "/created"),
                paid_at: unix_at(object, "/status_transitions/paid_at"),
                ..NormalizedRecord::default()
            },
            PayloadShape::Charge => NormalizedRecord {
                shape,
                email: first_text(object, &["/billing_details/email", "/receipt_email"]),
                name: text_at(object, "/billing_details/name"),
                external_customer_id: text_at(object, "/customer"),
                external_bill_id: text_at(object, "/invoice"),
                product_name: text_at(object, "/description"),
                amount: minor_units_at(object, "/amount"),
                status: text_at(object, "/status"),
                created_at: unix_at(object, "/created"),
                ..NormalizedRecord::default()
            },
            PayloadShape::Customer => NormalizedRecord {
                shape,
                email: text_at(object, "/email"),
                name: text_at(object, "/name"),
                external_customer_id: text_at(object, "/id"),
                created_at: unix_at(object, "/created"),
                ..NormalizedRecord::default()
            },
            PayloadShape::Empty => NormalizedRecord::default(),
        };

        match shape {
            PayloadShape::Subscription => record.subscription = subscription_facts(&record),
            PayloadShape::Bill => record.bill = bill_facts(&record),
            _ => {}
        }
        record
    }

    fn conversion_stage(&self, event_type: &str) -> Option<ConversionStage> {
        match event_type {
            "invoice.created" | "invoice.finalized" => Some(ConversionStage::Pending),
            "invoice.paid" | "invoice.payment_succeeded" => Some(ConversionStage::Paid),
            _ => None,
        }
    }
}

/// A Stripe event carries one object, so its facts are the flat fields.
fn subscription_facts(record: &NormalizedRecord) -> Option<SubscriptionFacts> {
    Some(SubscriptionFacts {
        external_id: record.external_subscription_id.clone()?,
        status: record.status.clone(),
        product_name: record.product_name.clone(),
        plan_name: record.plan_name.clone(),
        created_at: record.created_at,
    })
}

fn bill_facts(record: &NormalizedRecord) -> Option<BillFacts> {
    Some(BillFacts {
        external_id: record.external_bill_id.clone()?,
        external_subscription_id: record.external_subscription_id.clone(),
        product_name: record.product_name.clone(),
        amount: record.amount,
        status: record.status.clone(),
        due_at: record.due_at,
        created_at: record.created_at,
        paid_at: record.paid_at,
    })
}
