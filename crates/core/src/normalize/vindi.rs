//! Vindi webhook payloads: `{"event": {"type", "created_at", "data": {...}}}`
//! where `data` holds any of `subscription`, `bill`, `charge` or `customer`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::fields::{
    amount_at, first_text, first_timestamp, is_object_at, text_at, timestamp_at,
};
use super::{
    BillFacts, ConversionStage, NormalizedRecord, PayloadNormalizer, PayloadShape,
    SubscriptionFacts,
};
use crate::domain::event::EventSource;

const EMAIL: &[&str] = &[
    "/event/data/customer/email",
    "/event/data/bill/customer/email",
    "/event/data/subscription/customer/email",
    "/event/data/charge/customer/email",
];
const NAME: &[&str] = &[
    "/event/data/customer/name",
    "/event/data/bill/customer/name",
    "/event/data/subscription/customer/name",
    "/event/data/charge/customer/name",
];
const CUSTOMER_ID: &[&str] = &[
    "/event/data/customer/id",
    "/event/data/bill/customer/id",
    "/event/data/subscription/customer/id",
    "/event/data/charge/customer/id",
];
const SUBSCRIPTION_ID: &[&str] = &["/event/data/subscription/id", "/event/data/bill/subscription/id"];
const BILL_ID: &[&str] = &["/event/data/bill/id", "/event/data/charge/bill/id"];
const PRODUCT_NAME: &[&str] = &[
    "/event/data/bill/bill_items/0/product/name",
    "/event/data/subscription/product_items/0/product/name",
    "/event/data/charge/description",
];
const PLAN_NAME: &[&str] = &["/event/data/subscription/plan/name", "/event/data/bill/subscription/plan/name"];

#[derive(Clone, Copy, Debug, Default)]
pub struct VindiNormalizer;

impl PayloadNormalizer for VindiNormalizer {
    fn source(&self) -> EventSource {
        EventSource::Vindi
    }

    fn event_type(&self, payload: &Value) -> Option<String> {
        text_at(payload, "/event/type")
    }

    fn normalize(&self, _event_type: &str, payload: &Value) -> NormalizedRecord {
        let shape = shape_of(payload);
        let subscription = subscription_facts(payload);
        let bill = bill_facts(payload);

        let (status, created_at, paid_at) = match shape {
            PayloadShape::Subscription => subscription
                .as_ref()
                .map(|facts| (facts.status.clone(), facts.created_at, None))
                .unwrap_or_default(),
            PayloadShape::Bill => bill
                .as_ref()
                .map(|facts| (facts.status.clone(), facts.created_at, facts.paid_at))
                .unwrap_or_default(),
            PayloadShape::Charge => (
                text_at(payload, "/event/data/charge/status"),
                timestamp_at(payload, "/event/data/charge/created_at"),
                timestamp_at(payload, "/event/data/charge/paid_at"),
            ),
            PayloadShape::Customer | PayloadShape::Empty => {
                (None, timestamp_at(payload, "/event/created_at"), None)
            }
        };

        NormalizedRecord {
            shape,
            email: first_text(payload, EMAIL),
            name: first_text(payload, NAME),
            external_customer_id: first_text(payload, CUSTOMER_ID),
            external_subscription_id: first_text(payload, SUBSCRIPTION_ID),
            external_bill_id: first_text(payload, BILL_ID),
            product_name: first_text(payload, PRODUCT_NAME),
            plan_name: first_text(payload, PLAN_NAME),
            amount: amount_at(payload, "/event/data/bill/amount")
                .or_else(|| amount_at(payload, "/event/data/charge/amount")),
            status,
            due_at: first_timestamp(payload, &["/event/data/bill/due_at", "/event/data/charge/due_at"]),
            created_at,
            paid_at,
            subscription,
            bill,
        }
    }

    fn conversion_stage(&self, event_type: &str) -> Option<ConversionStage> {
        match event_type {
            "bill_created" => Some(ConversionStage::Pending),
            "bill_paid" => Some(ConversionStage::Paid),
            _ => None,
        }
    }
}

/// Paid timestamp of a bill sub-document: the first charge's `paid_at` when it
/// parses, else the bill's own `paid_at`.
pub fn bill_paid_at(bill: &Value) -> Option<DateTime<Utc>> {
    timestamp_at(bill, "/charges/0/paid_at").or_else(|| timestamp_at(bill, "/paid_at"))
}

fn subscription_facts(payload: &Value) -> Option<SubscriptionFacts> {
    let subscription = object_at(payload, "/event/data/subscription")?;
    Some(SubscriptionFacts {
        external_id: text_at(subscription, "/id")?,
        status: text_at(subscription, "/status"),
        product_name: text_at(subscription, "/product_items/0/product/name"),
        plan_name: text_at(subscription, "/plan/name"),
        created_at: timestamp_at(subscription, "/created_at")
            .or_else(|| timestamp_at(payload, "/event/created_at")),
    })
}

fn bill_facts(payload: &Value) -> Option<BillFacts> {
    let bill = object_at(payload, "/event/data/bill")?;
    Some(BillFacts {
        external_id: text_at(bill, "/id")?,
        external_subscription_id: text_at(bill, "/subscription/id")
            .or_else(|| text_at(payload, "/event/data/subscription/id")),
        product_name: text_at(bill, "/bill_items/0/product/name").or_else(|| {
            text_at(payload, "/event/data/subscription/product_items/0/product/name")
        }),
        amount: amount_at(bill, "/amount"),
        status: text_at(bill, "/status"),
        due_at: timestamp_at(bill, "/due_at"),
        created_at: timestamp_at(bill, "/created_at"),
        paid_at: bill_paid_at(bill),
    })
}

fn object_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a Value> {
    payload.pointer(pointer).filter(|value| value.is_object())
}

fn shape_of(payload: &Value) -> PayloadShape {
    if is_object_at(payload, "/event/data/subscription") {
        PayloadShape::Subscription
    } else if is_object_at(payload, "/event/data/bill") {
        PayloadShape::Bill
    } else if is_object_at(payload, "/event/data/charge") {
        PayloadShape::Charge
    } else if is_object_at(payload, "/event/data/customer") {
        PayloadShape::Customer
    } else {
        PayloadShape::Empty
    }
}
