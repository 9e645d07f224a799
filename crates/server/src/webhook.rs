//! Inbound provider webhooks.
//!
//! Every delivery is acknowledged with 200. The event log is the durable
//! record; reconciliation happens later in the batch loop and conversions go
//! through the dispatch queue, so neither can fail the response.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use billsync_core::classifier::ConversionClassifier;
use billsync_core::clock::Clock;
use billsync_core::domain::event::EventSource;
use billsync_core::intake;
use billsync_db::EventLogRepository;

use crate::dispatch_queue::{DispatchQueue, EnqueueOutcome};

#[derive(Clone)]
pub struct WebhookState {
    pub events: Arc<dyn EventLogRepository>,
    pub classifier: Arc<ConversionClassifier>,
    pub clock: Arc<dyn Clock>,
    /// `None` when CRM delivery is disabled.
    pub dispatch: Option<DispatchQueue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub status: String,
    pub event_id: Option<i64>,
    pub conversion: String,
    pub correlation_id: String,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(receive_default))
        .route("/webhooks/{source}", post(receive))
        .with_state(state)
}

async fn receive_default(
    state: State<WebhookState>,
    query: Query<WebhookQuery>,
    body: Bytes,
) -> (StatusCode, Json<WebhookAck>) {
    receive(state, Path(EventSource::Vindi.as_str().to_string()), query, body).await
}

pub async fn receive(
    State(state): State<WebhookState>,
    Path(source): Path<String>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> (StatusCode, Json<WebhookAck>) {
    let correlation_id = Uuid::new_v4().to_string();
    let ack = |status: &str, event_id: Option<i64>, conversion: &str| {
        (
            StatusCode::OK,
            Json(WebhookAck {
                status: status.to_string(),
                event_id,
                conversion: conversion.to_string(),
                correlation_id: correlation_id.clone(),
            }),
        )
    };

    let Some(source) = EventSource::parse(&source) else {
        warn!(
            event_name = "system.webhook.unknown_source",
            correlation_id = %correlation_id,
            source = %source,
            "webhook for unknown source ignored"
        );
        return ack("ignored", None, "skipped");
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(
                event_name = "system.webhook.invalid_json",
                correlation_id = %correlation_id,
                source = source.as_str(),
                error = %error,
                "webhook body is not json"
            );
            return ack("ignored", None, "skipped");
        }
    };

    let intake = intake::prepare(
        source,
        query.event_type.as_deref(),
        payload,
        &state.classifier,
        state.clock.now(),
    );
    info!(
        event_name = "system.webhook.received",
        correlation_id = %correlation_id,
        source = source.as_str(),
        event_type = %intake.event.event_type,
        conversion_identifier = intake.event.conversion_identifier.as_deref().unwrap_or("none"),
        "webhook received"
    );

    let event_id = match state.events.append(intake.event).await {
        Ok(id) => {
            info!(
                event_name = "system.webhook.event_appended",
                correlation_id = %correlation_id,
                event_id = id.0,
                "event appended to log"
            );
            Some(id.0)
        }
        Err(error) => {
            warn!(
                event_name = "system.webhook.append_failed",
                correlation_id = %correlation_id,
                error = %error,
                "could not append event to log"
            );
            None
        }
    };

    let conversion = match (intake.conversion, &state.dispatch) {
        (None, _) => "skipped",
        (Some(_), None) => "disabled",
        (Some(job), Some(queue)) => match queue.enqueue(job) {
            EnqueueOutcome::Queued => "queued",
            EnqueueOutcome::Full => "dropped",
            EnqueueOutcome::Closed => "closed",
        },
    };

    ack(if event_id.is_some() { "accepted" } else { "unrecorded" }, event_id, conversion)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tower::ServiceExt;

    use billsync_core::classifier::ConversionClassifier;
    use billsync_core::clock::ManualClock;
    use billsync_core::domain::event::{EventId, EventSource};
    use billsync_db::{EventLogRepository, InMemoryBillingStore};

    use super::{router, WebhookAck, WebhookState};
    use crate::dispatch_queue::DispatchQueue;

    fn state(store: Arc<InMemoryBillingStore>, dispatch: Option<DispatchQueue>) -> WebhookState {
        let now = Utc.with_ymd_and_hms(2025, 2, 10, 13, 0, 0).single().expect("timestamp");
        WebhookState {
            events: store,
            classifier: Arc::new(ConversionClassifier::default()),
            clock: Arc::new(ManualClock::new(now)),
            dispatch,
        }
    }

    fn bill_paid() -> String {
        json!({
            "event": {
                "type": "bill_paid",
                "data": {
                    "bill": {
                        "id": 7001,
                        "status": "paid",
                        "customer": {"name": "Ana", "email": "Ana@Example.com"},
                        "bill_items": [{"product": {"name": "Pós-graduação em CCIH"}}]
                    }
                }
            }
        })
        .to_string()
    }

    async fn post(app: axum::Router, uri: &str, body: String) -> (StatusCode, WebhookAck) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("ack json"))
    }

    #[tokio::test]
    async fn bill_paid_is_logged_and_conversion_queued() {
        let store = Arc::new(InMemoryBillingStore::default());
        let (queue, mut receiver) = DispatchQueue::bounded(4);
        let app = router(state(store.clone(), Some(queue)));

        let (status, ack) = post(app, "/webhooks/vindi", bill_paid()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack.status, "accepted");
        assert_eq!(ack.conversion, "queued");

        let event = store.find(EventId(ack.event_id.expect("id"))).await.expect("find").expect("event");
        assert_eq!(event.source, EventSource::Vindi);
        assert_eq!(event.event_type, "bill_paid");
        assert!(!event.processed);

        let job = receiver.recv().await.expect("queued job");
        assert_eq!(job.email, "ana@example.com");
        assert_eq!(job.conversion_identifier, "pos-graduacao-ccih-pago");
    }

    #[tokio::test]
    async fn malformed_or_unknown_deliveries_are_still_acknowledged() {
        let store = Arc::new(InMemoryBillingStore::default());
        let app = router(state(store.clone(), None));

        let (status, ack) = post(app.clone(), "/webhooks/vindi", "{not json".to_string()).await;
        assert_eq!((status, ack.status.as_str()), (StatusCode::OK, "ignored"));

        let (status, ack) = post(app, "/webhooks/paypal", bill_paid()).await;
        assert_eq!((status, ack.status.as_str()), (StatusCode::OK, "ignored"));

        assert_eq!(store.counts().await.expect("counts").pending, 0);
    }

    #[tokio::test]
    async fn legacy_route_defaults_to_vindi_and_respects_disabled_crm() {
        let store = Arc::new(InMemoryBillingStore::default());
        let app = router(state(store.clone(), None));

        let (status, ack) = post(app, "/webhook", bill_paid()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack.status, "accepted");
        assert_eq!(ack.conversion, "disabled");
        assert_eq!(store.counts().await.expect("counts").pending, 1);
    }
}
