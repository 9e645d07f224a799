//! Webhook intake: turns one raw provider document into the event-log row and,
//! when the event marks a funnel milestone for a known campaign, the
//! conversion to report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::ConversionClassifier;
use crate::domain::customer::normalize_email;
use crate::domain::event::{EventSource, NewBillingEvent};
use crate::normalize::normalizer_for;

const UNKNOWN_EVENT_TYPE: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub email: String,
    pub conversion_identifier: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Intake {
    pub event: NewBillingEvent,
    pub conversion: Option<ConversionJob>,
}

/// Builds the event-log row for `payload`. The event type embedded in the
/// payload wins over `declared_type`.
pub fn prepare(
    source: EventSource,
    declared_type: Option<&str>,
    payload: Value,
    classifier: &ConversionClassifier,
    received_at: DateTime<Utc>,
) -> Intake {
    let normalizer = normalizer_for(source);
    let event_type = normalizer
        .event_type(&payload)
        .or_else(|| declared_type.map(str::to_string))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());

    let record = normalizer.normalize(&event_type, &payload);
    let email = record.email.as_deref().and_then(normalize_email);
    let product_name = record.classification_text().map(str::to_string);

    let conversion_identifier = normalizer.conversion_stage(&event_type).and_then(|stage| {
        product_name.as_deref().and_then(|text| classifier.conversion_identifier(text, stage))
    });

    let conversion = match (&email, &conversion_identifier) {
        (Some(email), Some(identifier)) => Some(ConversionJob {
            email: email.clone(),
            conversion_identifier: identifier.clone(),
        }),
        _ => None,
    };

    Intake {
        event: NewBillingEvent {
            source,
            event_type,
            payload,
            email,
            product_name,
            conversion_identifier,
            received_at,
        },
        conversion,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::prepare;
    use crate::classifier::ConversionClassifier;
    use crate::domain::event::EventSource;

    #[test]
    fn paid_bill_for_known_product_yields_conversion() {
        let received_at = Utc.with_ymd_and_hms(2025, 2, 10, 13, 0, 0).single().expect("timestamp");
        let payload = json!({"event": {"type": "bill_paid", "data": {"bill": {
            "id": 7001,
            "customer": {"email": "Ana@Example.com"},
            "bill_items": [{"product": {"name": "Pós-graduação em CCIH"}}]
        }}}});

        let intake = prepare(
            EventSource::Vindi,
            None,
            payload,
            &ConversionClassifier::default(),
            received_at,
        );

        assert_eq!(intake.event.event_type, "bill_paid");
        assert_eq!(intake.event.email.as_deref(), Some("ana@example.com"));
        let job = intake.conversion.expect("conversion job");
        assert_eq!(job.conversion_identifier, "pos-graduacao-ccih-pago");
        assert_eq!(job.email, "ana@example.com");
    }

    #[test]
    fn non_milestone_events_are_logged_without_conversion() {
        let payload = json!({"event": {"type": "subscription_created", "data": {"subscription": {
            "id": 3001,
            "customer": {"email": "ana@example.com"},
            "plan": {"name": "Jornada Multi-R"}
        }}}});

        let intake =
            prepare(EventSource::Vindi, None, payload, &ConversionClassifier::default(), Utc::now());

        assert_eq!(intake.event.product_name.as_deref(), Some("Jornada Multi-R"));
        assert_eq!(intake.event.conversion_identifier, None);
        assert!(intake.conversion.is_none());
    }

    #[test]
    fn declared_type_is_used_when_payload_has_none() {
        let intake = prepare(
            EventSource::Stripe,
            Some("invoice.paid"),
            json!({"data": {}}),
            &ConversionClassifier::default(),
            Utc::now(),
        );
        assert_eq!(intake.event.event_type, "invoice.paid");

        let unnamed =
            prepare(EventSource::Stripe, None, json!({}), &ConversionClassifier::default(), Utc::now());
        assert_eq!(unnamed.event.event_type, "unknown");
    }
}
