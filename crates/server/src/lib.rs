pub mod bootstrap;
pub mod dispatch_queue;
pub mod health;
pub mod logging;
pub mod processor;
pub mod scheduler;
pub mod webhook;

use axum::Router;

use crate::health::HealthState;
use crate::webhook::WebhookState;

pub use bootstrap::{bootstrap, bootstrap_with_config, Application, BootstrapError};
pub use processor::{BatchReport, ProcessorError, ReconciliationEngine};
pub use scheduler::{BatchScheduler, TickOutcome};

/// Webhook ingestion plus the health check, served from one listener.
pub fn router(webhooks: WebhookState, health: HealthState) -> Router {
    webhook::router(webhooks).merge(health::router(health))
}
