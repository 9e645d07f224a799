//! Batch reconciliation of the event log into customer, subscription and bill
//! rows.
//!
//! Events are applied one at a time in ascending id order. Each event is its
//! own unit of work: a failure is recorded against that event and the loop
//! moves on, except when storage itself is gone, in which case the batch stops
//! and the remaining events wait for the next cycle.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use billsync_core::clock::Clock;
use billsync_core::domain::event::{BillingEvent, EventState};
use billsync_core::errors::ApplicationError;
use billsync_core::normalize::normalize;
use billsync_core::reconcile::ReconciliationPlan;
use billsync_db::{EntityStore, EventLogRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("could not load pending events: {0}")]
    LoadPending(#[source] ApplicationError),
}

impl ProcessorError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::LoadPending(source) => source.error_class(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventFailure {
    pub event_id: i64,
    pub error_class: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub selected: usize,
    pub processed: usize,
    /// Processed events that carried nothing to write.
    pub noop: usize,
    /// Events another runner processed after this batch selected them.
    pub skipped: usize,
    pub failed: usize,
    /// Set when storage became unavailable mid-batch.
    pub aborted: bool,
    pub failures: Vec<EventFailure>,
}

enum EventOutcome {
    Applied { noop: bool },
    AlreadyProcessed,
}

pub struct ReconciliationEngine {
    events: Arc<dyn EventLogRepository>,
    entities: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    batch_size: u32,
}

impl ReconciliationEngine {
    pub fn new(
        events: Arc<dyn EventLogRepository>,
        entities: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> Self {
        Self { events, entities, clock, batch_size: batch_size.max(1) }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub async fn run_batch(&self) -> Result<BatchReport, ProcessorError> {
        let pending = self
            .events
            .list_pending(self.batch_size)
            .await
            .map_err(|error| ProcessorError::LoadPending(error.into()))?;

        let mut report = BatchReport { selected: pending.len(), ..BatchReport::default() };
        info!(
            event_name = "system.processor.batch_started",
            selected = report.selected,
            batch_size = self.batch_size,
            "reconciliation batch started"
        );

        for event in pending {
            match self.process_event(&event).await {
                Ok(EventOutcome::Applied { noop }) => {
                    report.processed += 1;
                    if noop {
                        report.noop += 1;
                    }
                }
                Ok(EventOutcome::AlreadyProcessed) => report.skipped += 1,
                Err(failure) => {
                    report.failed += 1;
                    report.failures.push(EventFailure {
                        event_id: event.id.0,
                        error_class: failure.error_class(),
                        message: failure.to_string(),
                    });

                    if failure.aborts_batch() {
                        error!(
                            event_name = "system.processor.batch_aborted",
                            event_id = event.id.0,
                            error_class = failure.error_class(),
                            error = %failure,
                            "storage unavailable, stopping batch"
                        );
                        report.aborted = true;
                        break;
                    }

                    self.record_failure(&event, &failure).await;
                }
            }
        }

        info!(
            event_name = "system.processor.batch_finished",
            selected = report.selected,
            processed = report.processed,
            noop = report.noop,
            skipped = report.skipped,
            failed = report.failed,
            aborted = report.aborted,
            "reconciliation batch finished"
        );
        Ok(report)
    }

    async fn process_event(&self, event: &BillingEvent) -> Result<EventOutcome, ApplicationError> {
        if !event.state().can_transition_to(EventState::InProgress) {
            return Ok(EventOutcome::AlreadyProcessed);
        }

        let record = normalize(event.source, &event.event_type, &event.payload);
        let processed_at = self.clock.now();
        let plan = ReconciliationPlan::from_record(&record, processed_at);

        match self.entities.apply(event.id, &plan, processed_at).await {
            Ok(_) => {}
            Err(RepositoryError::AlreadyProcessed(_)) => {
                info!(
                    event_name = "system.processor.event_already_processed",
                    event_id = event.id.0,
                    "event processed by another runner, skipping"
                );
                return Ok(EventOutcome::AlreadyProcessed);
            }
            Err(error) => return Err(error.into()),
        }

        info!(
            event_name = "system.processor.event_processed",
            event_id = event.id.0,
            source = event.source.as_str(),
            event_type = %event.event_type,
            shape = ?record.shape,
            noop = plan.is_noop(),
            "event reconciled"
        );
        Ok(EventOutcome::Applied { noop: plan.is_noop() })
    }

    async fn record_failure(&self, event: &BillingEvent, failure: &ApplicationError) {
        warn!(
            event_name = "system.processor.event_failed",
            event_id = event.id.0,
            attempts = event.attempts + 1,
            error_class = failure.error_class(),
            error = %failure,
            "event left pending for the next cycle"
        );

        if let Err(error) = self.events.record_failure(event.id, &failure.to_string()).await {
            warn!(
                event_name = "system.processor.failure_bookkeeping_failed",
                event_id = event.id.0,
                error = %error,
                "could not record event failure"
            );
        }
    }
}
