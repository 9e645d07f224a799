use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use billsync_core::domain::event::{BillingEvent, EventId, EventSource, NewBillingEvent};

use super::{
    parse_optional_timestamp, parse_timestamp, parse_u32, EventCounts, EventLogRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlEventLogRepository {
    pool: DbPool,
}

impl SqlEventLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EventLogRepository for SqlEventLogRepository {
    async fn append(&self, event: NewBillingEvent) -> Result<EventId, RepositoryError> {
        let id = sqlx::query(
            "INSERT INTO billing_event (
                source,
                event_type,
                payload_json,
                email,
                product_name,
                conversion_identifier,
                processed,
                attempts,
                received_at
             ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(event.payload.to_string())
        .bind(event.email.as_deref())
        .bind(event.product_name.as_deref())
        .bind(event.conversion_identifier.as_deref())
        .bind(event.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(EventId(id))
    }

    async fn find(&self, id: EventId) -> Result<Option<BillingEvent>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                source,
                event_type,
                payload_json,
                processed,
                attempts,
                last_error,
                received_at,
                processed_at
             FROM billing_event
             WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(event_from_row).transpose()
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<BillingEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                source,
                event_type,
                payload_json,
                processed,
                attempts,
                last_error,
                received_at,
                processed_at
             FROM billing_event
             WHERE processed = 0
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn record_failure(&self, id: EventId, error: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE billing_event
             SET attempts = attempts + 1, last_error = ?
             WHERE id = ? AND processed = 0",
        )
        .bind(error)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM billing_event WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(RepositoryError::UnknownEvent(id));
            }
        }

        Ok(())
    }

    async fn counts(&self) -> Result<EventCounts, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN processed = 0 THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN processed = 1 THEN 1 ELSE 0 END), 0) AS processed,
                COALESCE(SUM(CASE WHEN processed = 0 AND attempts > 0 THEN 1 ELSE 0 END), 0)
                    AS failing
             FROM billing_event",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EventCounts {
            pending: parse_count("pending", row.try_get("pending")?)?,
            processed: parse_count("processed", row.try_get("processed")?)?,
            failing: parse_count("failing", row.try_get("failing")?)?,
        })
    }
}

fn event_from_row(row: SqliteRow) -> Result<BillingEvent, RepositoryError> {
    let source_raw: String = row.try_get("source")?;
    let source = EventSource::parse(&source_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event source `{source_raw}`")))?;
    let payload_raw: String = row.try_get("payload_json")?;
    let payload = serde_json::from_str::<Value>(&payload_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid payload_json: {error}")))?;

    Ok(BillingEvent {
        id: EventId(row.try_get("id")?),
        source,
        event_type: row.try_get("event_type")?,
        payload,
        processed: row.try_get::<i64, _>("processed")? != 0,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        last_error: row.try_get("last_error")?,
        received_at: parse_timestamp("received_at", row.try_get("received_at")?)?,
        processed_at: parse_optional_timestamp("processed_at", row.try_get("processed_at")?)?,
    })
}

fn parse_count(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `{column}` (expected count): {value}"))
    })
}
