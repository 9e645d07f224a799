//! SQL entity store. The `ON CONFLICT` clauses below encode the same merge
//! rules as `billsync_core::reconcile`: `COALESCE(excluded.x, table.x)` takes
//! the incoming value when present, `COALESCE(table.x, excluded.x)` keeps the
//! first value written.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use billsync_core::domain::bill::{Bill, BillId, BillStatus};
use billsync_core::domain::customer::{Customer, CustomerId};
use billsync_core::domain::event::EventId;
use billsync_core::domain::subscription::{Subscription, SubscriptionId, SubscriptionStatus};
use billsync_core::reconcile::{BillUpsert, CustomerUpsert, ReconciliationPlan, SubscriptionUpsert};

use super::{
    parse_optional_decimal, parse_optional_timestamp, parse_timestamp, AppliedPlan, EntityStore,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlEntityStore {
    pool: DbPool,
}

impl SqlEntityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EntityStore for SqlEntityStore {
    async fn apply(
        &self,
        event_id: EventId,
        plan: &ReconciliationPlan,
        processed_at: DateTime<Utc>,
    ) -> Result<AppliedPlan, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let updated_at = processed_at.to_rfc3339();

        // Claim the row first: a concurrent runner that already processed it
        // leaves nothing to apply.
        let claimed = sqlx::query(
            "UPDATE billing_event
             SET processed = 1, processed_at = ?, last_error = NULL
             WHERE id = ? AND processed = 0",
        )
        .bind(&updated_at)
        .bind(event_id.0)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM billing_event WHERE id = ?")
                .bind(event_id.0)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => RepositoryError::AlreadyProcessed(event_id),
                None => RepositoryError::UnknownEvent(event_id),
            });
        }

        let customer_id = match &plan.customer {
            Some(customer) => Some(upsert_customer(&mut tx, customer, &updated_at).await?),
            None => None,
        };
        let subscription_id = match &plan.subscription {
            Some(subscription) => {
                Some(upsert_subscription(&mut tx, subscription, customer_id, &updated_at).await?)
            }
            None => None,
        };
        let bill_id = match &plan.bill {
            Some(bill) => Some(upsert_bill(&mut tx, bill, customer_id, &updated_at).await?),
            None => None,
        };

        tx.commit().await?;

        Ok(AppliedPlan { customer_id, subscription_id, bill_id })
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query("SELECT id, external_id, name, email FROM customer WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(customer_from_row).transpose()
    }

    async fn find_subscription(
        &self,
        external_id: &str,
    ) -> Result<Option<Subscription>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                external_id,
                customer_id,
                product_name,
                plan_name,
                status,
                created_at
             FROM subscription
             WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(subscription_from_row).transpose()
    }

    async fn find_bill(&self, external_id: &str) -> Result<Option<Bill>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                external_id,
                external_subscription_id,
                customer_id,
                product_name,
                amount,
                status,
                due_at,
                created_at,
                paid_at
             FROM bill
             WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(bill_from_row).transpose()
    }
}

async fn upsert_customer(
    tx: &mut Transaction<'_, Sqlite>,
    customer: &CustomerUpsert,
    updated_at: &str,
) -> Result<CustomerId, RepositoryError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO customer (email, name, external_id, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(email) DO UPDATE SET
            name = COALESCE(excluded.name, customer.name),
            external_id = COALESCE(customer.external_id, excluded.external_id),
            updated_at = excluded.updated_at
         RETURNING id",
    )
    .bind(&customer.email)
    .bind(customer.name.as_deref())
    .bind(customer.external_id.as_deref())
    .bind(updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(CustomerId(id))
}

async fn upsert_subscription(
    tx: &mut Transaction<'_, Sqlite>,
    subscription: &SubscriptionUpsert,
    customer_id: Option<CustomerId>,
    updated_at: &str,
) -> Result<SubscriptionId, RepositoryError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO subscription (
            external_id,
            customer_id,
            product_name,
            plan_name,
            status,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(external_id) DO UPDATE SET
            customer_id = COALESCE(subscription.customer_id, excluded.customer_id),
            product_name = COALESCE(excluded.product_name, subscription.product_name),
            plan_name = COALESCE(excluded.plan_name, subscription.plan_name),
            status = COALESCE(excluded.status, subscription.status),
            created_at = COALESCE(subscription.created_at, excluded.created_at),
            updated_at = excluded.updated_at
         RETURNING id",
    )
    .bind(&subscription.external_id)
    .bind(customer_id.map(|id| id.0))
    .bind(subscription.product_name.as_deref())
    .bind(subscription.plan_name.as_deref())
    .bind(subscription.status.as_ref().map(SubscriptionStatus::as_str))
    .bind(subscription.created_at.map(|value| value.to_rfc3339()))
    .bind(updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(SubscriptionId(id))
}

async fn upsert_bill(
    tx: &mut Transaction<'_, Sqlite>,
    bill: &BillUpsert,
    customer_id: Option<CustomerId>,
    updated_at: &str,
) -> Result<BillId, RepositoryError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO bill (
            external_id,
            external_subscription_id,
            customer_id,
            product_name,
            amount,
            status,
            due_at,
            created_at,
            paid_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(external_id) DO UPDATE SET
            external_subscription_id =
                COALESCE(bill.external_subscription_id, excluded.external_subscription_id),
            customer_id = COALESCE(bill.customer_id, excluded.customer_id),
            product_name = COALESCE(excluded.product_name, bill.product_name),
            amount = COALESCE(excluded.amount, bill.amount),
            status = COALESCE(excluded.status, bill.status),
            due_at = COALESCE(excluded.due_at, bill.due_at),
            paid_at = COALESCE(excluded.paid_at, bill.paid_at),
            updated_at = excluded.updated_at
         RETURNING id",
    )
    .bind(&bill.external_id)
    .bind(bill.external_subscription_id.as_deref())
    .bind(customer_id.map(|id| id.0))
    .bind(bill.product_name.as_deref())
    .bind(bill.amount.map(|amount| amount.to_string()))
    .bind(bill.status.as_ref().map(BillStatus::as_str))
    .bind(bill.due_at.map(|value| value.to_rfc3339()))
    .bind(bill.created_at.to_rfc3339())
    .bind(bill.paid_at.map(|value| value.to_rfc3339()))
    .bind(updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(BillId(id))
}

fn customer_from_row(row: SqliteRow) -> Result<Customer, RepositoryError> {
    Ok(Customer {
        id: CustomerId(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
    })
}

fn subscription_from_row(row: SqliteRow) -> Result<Subscription, RepositoryError> {
    Ok(Subscription {
        id: SubscriptionId(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        customer_id: row.try_get::<Option<i64>, _>("customer_id")?.map(CustomerId),
        product_name: row.try_get("product_name")?,
        plan_name: row.try_get("plan_name")?,
        status: row.try_get::<Option<String>, _>("status")?.map(|raw| SubscriptionStatus::parse(&raw)),
        created_at: parse_optional_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn bill_from_row(row: SqliteRow) -> Result<Bill, RepositoryError> {
    Ok(Bill {
        id: BillId(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        external_subscription_id: row.try_get("external_subscription_id")?,
        customer_id: row.try_get::<Option<i64>, _>("customer_id")?.map(CustomerId),
        product_name: row.try_get("product_name")?,
        amount: parse_optional_decimal("amount", row.try_get("amount")?)?,
        status: row.try_get::<Option<String>, _>("status")?.map(|raw| BillStatus::parse(&raw)),
        due_at: parse_optional_timestamp("due_at", row.try_get("due_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        paid_at: parse_optional_timestamp("paid_at", row.try_get("paid_at")?)?,
    })
}
