//! Translation of a normalized record into entity upserts, and the per-field
//! merge rules those upserts obey.
//!
//! | field | rule |
//! |---|---|
//! | customer name | incoming when present |
//! | customer external id | first write wins |
//! | subscription status | incoming when present |
//! | subscription created_at | first write wins |
//! | bill status | incoming when present |
//! | bill subscription ref | first write wins |
//! | bill paid_at | incoming when present, never erased |
//! | bill created_at | first write wins, processing time on first insert |
//!
//! Descriptive fields (product, plan, amount, due date) take the incoming
//! value when present. The customer reference on subscriptions and bills is
//! first write wins. Every rule is idempotent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::bill::{Bill, BillId, BillStatus};
use crate::domain::customer::{normalize_email, Customer, CustomerId};
use crate::domain::subscription::{Subscription, SubscriptionId, SubscriptionStatus};
use crate::normalize::NormalizedRecord;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerUpsert {
    pub email: String,
    pub name: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpsert {
    pub external_id: String,
    pub product_name: Option<String>,
    pub plan_name: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillUpsert {
    pub external_id: String,
    pub external_subscription_id: Option<String>,
    pub product_name: Option<String>,
    pub amount: Option<Decimal>,
    pub status: Option<BillStatus>,
    pub due_at: Option<DateTime<Utc>>,
    /// Already defaulted to processing time when the payload had none.
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Entity writes derived from one event. Applied atomically by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub customer: Option<CustomerUpsert>,
    pub subscription: Option<SubscriptionUpsert>,
    pub bill: Option<BillUpsert>,
}

impl ReconciliationPlan {
    pub fn from_record(record: &NormalizedRecord, processed_at: DateTime<Utc>) -> Self {
        if !record.is_actionable() {
            return Self::default();
        }

        let customer = record.email.as_deref().and_then(normalize_email).map(|email| CustomerUpsert {
            email,
            name: record.name.clone(),
            external_id: record.external_customer_id.clone(),
        });

        let subscription = record.subscription.as_ref().map(|facts| SubscriptionUpsert {
            external_id: facts.external_id.clone(),
            product_name: facts.product_name.clone().or_else(|| facts.plan_name.clone()),
            plan_name: facts.plan_name.clone(),
            status: facts.status.as_deref().map(SubscriptionStatus::parse),
            created_at: facts.created_at,
        });

        let bill = record.bill.as_ref().map(|facts| {
            let status = facts.status.as_deref().map(BillStatus::parse);
            let paid = status.as_ref().map(BillStatus::is_paid).unwrap_or(false);
            BillUpsert {
                external_id: facts.external_id.clone(),
                external_subscription_id: facts.external_subscription_id.clone(),
                product_name: facts.product_name.clone(),
                amount: facts.amount,
                status,
                due_at: facts.due_at,
                created_at: facts.created_at.unwrap_or(processed_at),
                paid_at: if paid { facts.paid_at } else { None },
            }
        });

        Self { customer, subscription, bill }
    }

    pub fn is_noop(&self) -> bool {
        self.customer.is_none() && self.subscription.is_none() && self.bill.is_none()
    }
}

impl CustomerUpsert {
    pub fn into_new(self, id: CustomerId) -> Customer {
        Customer { id, external_id: self.external_id, name: self.name, email: self.email }
    }

    pub fn merge_into(&self, existing: &mut Customer) {
        keep_incoming(&mut existing.name, &self.name);
        keep_first(&mut existing.external_id, &self.external_id);
    }
}

impl SubscriptionUpsert {
    pub fn into_new(self, id: SubscriptionId, customer_id: Option<CustomerId>) -> Subscription {
        Subscription {
            id,
            external_id: self.external_id,
            customer_id,
            product_name: self.product_name,
            plan_name: self.plan_name,
            status: self.status,
            created_at: self.created_at,
        }
    }

    pub fn merge_into(&self, existing: &mut Subscription, customer_id: Option<CustomerId>) {
        keep_first(&mut existing.customer_id, &customer_id);
        keep_incoming(&mut existing.product_name, &self.product_name);
        keep_incoming(&mut existing.plan_name, &self.plan_name);
        keep_incoming(&mut existing.status, &self.status);
        keep_first(&mut existing.created_at, &self.created_at);
    }
}

impl BillUpsert {
    pub fn into_new(self, id: BillId, customer_id: Option<CustomerId>) -> Bill {
        Bill {
            id,
            external_id: self.external_id,
            external_subscription_id: self.external_subscription_id,
            customer_id,
            product_name: self.product_name,
            amount: self.amount,
            status: self.status,
            due_at: self.due_at,
            created_at: self.created_at,
            paid_at: self.paid_at,
        }
    }

    pub fn merge_into(&self, existing: &mut Bill, customer_id: Option<CustomerId>) {
        keep_first(&mut existing.customer_id, &customer_id);
        keep_first(&mut existing.external_subscription_id, &self.external_subscription_id);
        keep_incoming(&mut existing.product_name, &self.product_name);
        keep_incoming(&mut existing.amount, &self.amount);
        keep_incoming(&mut existing.status, &self.status);
        keep_incoming(&mut existing.due_at, &self.due_at);
        keep_incoming(&mut existing.paid_at, &self.paid_at);
    }
}

fn keep_first<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(incoming);
    }
}

fn keep_incoming<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        slot.clone_from(incoming);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{BillUpsert, CustomerUpsert, ReconciliationPlan, SubscriptionUpsert};
    use crate::domain::bill::{BillId, BillStatus};
    use crate::domain::customer::{Customer, CustomerId};
    use crate::domain::subscription::{SubscriptionId, SubscriptionStatus};
    use crate::normalize::{
        BillFacts, NormalizedRecord, PayloadNormalizer, PayloadShape, SubscriptionFacts,
        VindiNormalizer,
    };

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, hour, 0, 0).single().expect("valid timestamp")
    }

    fn bill_upsert(status: &str, paid_at: Option<DateTime<Utc>>) -> BillUpsert {
        BillUpsert {
            external_id: "7001".to_string(),
            external_subscription_id: None,
            product_name: Some("Pós CCIH".to_string()),
            amount: Some(Decimal::new(497, 0)),
            status: Some(BillStatus::parse(status)),
            due_at: None,
            created_at: ts(9),
            paid_at,
        }
    }

    #[test]
    fn customer_name_is_last_write_wins_and_external_id_first_write_wins() {
        let mut customer = Customer {
            id: CustomerId(1),
            external_id: Some("55".to_string()),
            name: Some("Ana".to_string()),
            email: "ana@example.com".to_string(),
        };

        CustomerUpsert {
            email: customer.email.clone(),
            name: Some("Ana Souza".to_string()),
            external_id: Some("99".to_string()),
        }
        .merge_into(&mut customer);
        assert_eq!(customer.name.as_deref(), Some("Ana Souza"));
        assert_eq!(customer.external_id.as_deref(), Some("55"));

        CustomerUpsert { email: customer.email.clone(), name: None, external_id: None }
            .merge_into(&mut customer);
        assert_eq!(customer.name.as_deref(), Some("Ana Souza"));
    }

    #[test]
    fn subscription_created_at_keeps_earliest_applied_value() {
        let first = SubscriptionUpsert {
            external_id: "3001".to_string(),
            product_name: None,
            plan_name: Some("Plano A".to_string()),
            status: Some(SubscriptionStatus::Active),
            created_at: Some(ts(8)),
        };
        let mut subscription = first.clone().into_new(SubscriptionId(1), None);

        let later = SubscriptionUpsert {
            status: Some(SubscriptionStatus::Canceled),
            created_at: Some(ts(12)),
            ..first
        };
        later.merge_into(&mut subscription, Some(CustomerId(4)));

        assert_eq!(subscription.created_at, Some(ts(8)));
        assert_eq!(subscription.status, Some(SubscriptionStatus::Canceled));
        assert_eq!(subscription.customer_id, Some(CustomerId(4)));
    }

    #[test]
    fn bill_status_follows_the_last_applied_event() {
        let mut bill = bill_upsert("paid", Some(ts(10))).into_new(BillId(1), None);
        bill_upsert("pending", None).merge_into(&mut bill, None);

        assert_eq!(bill.status, Some(BillStatus::Pending));
        assert_eq!(bill.paid_at, Some(ts(10)), "null paid_at must not erase a known payment");
    }

    #[test]
    fn bill_merge_is_idempotent() {
        let upsert = bill_upsert("paid", Some(ts(10)));
        let mut once = upsert.clone().into_new(BillId(1), Some(CustomerId(2)));
        upsert.merge_into(&mut once, Some(CustomerId(2)));
        let snapshot = once.clone();
        upsert.merge_into(&mut once, Some(CustomerId(2)));

        assert_eq!(once, snapshot);
    }

    #[test]
    fn plan_defaults_bill_created_at_to_processing_time() {
        let record = NormalizedRecord {
            shape: PayloadShape::Bill,
            email: Some(" Ana@Example.com ".to_string()),
            bill: Some(BillFacts {
                external_id: "7001".to_string(),
                external_subscription_id: None,
                product_name: None,
                amount: None,
                status: Some("pending".to_string()),
                due_at: None,
                created_at: None,
                paid_at: Some(ts(11)),
            }),
            ..NormalizedRecord::default()
        };

        let plan = ReconciliationPlan::from_record(&record, ts(15));
        let bill = plan.bill.expect("bill upsert");

        assert_eq!(bill.created_at, ts(15));
        assert_eq!(bill.paid_at, None, "paid_at only applies when the bill is paid");
        assert_eq!(plan.customer.map(|c| c.email).as_deref(), Some("ana@example.com"));
        assert!(plan.subscription.is_none());
    }

    #[test]
    fn plan_without_email_skips_customer_but_keeps_subscription() {
        let record = NormalizedRecord {
            shape: PayloadShape::Subscription,
            subscription: Some(SubscriptionFacts {
                external_id: "sub_1".to_string(),
                status: Some("active".to_string()),
                product_name: None,
                plan_name: None,
                created_at: None,
            }),
            ..NormalizedRecord::default()
        };

        let plan = ReconciliationPlan::from_record(&record, ts(15));
        assert!(plan.customer.is_none());
        assert!(plan.subscription.is_some());
        assert!(!plan.is_noop());
    }

    #[test]
    fn payload_with_subscription_and_bill_plans_both_upserts() {
        let payload = json!({
            "event": {
                "type": "bill_paid",
                "data": {
                    "subscription": {"id": 3001, "status": "active"},
                    "bill": {
                        "id": 7001,
                        "status": "paid",
                        "amount": "10",
                        "paid_at": "2025-02-10T10:19:00Z",
                        "customer": {"email": "ana@example.com"}
                    }
                }
            }
        });
        let record = VindiNormalizer.normalize("bill_paid", &payload);

        let plan = ReconciliationPlan::from_record(&record, ts(15));
        let subscription = plan.subscription.expect("subscription upsert");
        let bill = plan.bill.expect("bill upsert");

        assert_eq!(subscription.external_id, "3001");
        assert_eq!(subscription.status, Some(SubscriptionStatus::Active));
        assert_eq!(bill.external_id, "7001");
        assert_eq!(bill.status, Some(BillStatus::Paid));
        assert_eq!(bill.amount, Some(Decimal::new(10, 0)));
        assert_eq!(bill.external_subscription_id.as_deref(), Some("3001"));
        assert!(bill.paid_at.is_some());
        assert_eq!(plan.customer.map(|c| c.email).as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn empty_record_produces_noop_plan() {
        let plan = ReconciliationPlan::from_record(&NormalizedRecord::default(), ts(15));
        assert!(plan.is_noop());
    }
}
