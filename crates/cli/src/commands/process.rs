use std::sync::Arc;

use billsync_core::clock::SystemClock;
use billsync_db::{SqlEntityStore, SqlEventLogRepository};
use billsync_server::{BatchReport, ReconciliationEngine};

use crate::commands::{load_config, open_pool, runtime, CommandResult};

/// Runs a single reconciliation batch. Exit code 6 means the batch could not
/// load events or stopped early because storage became unavailable.
pub fn run(batch_size: Option<u32>) -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let engine = ReconciliationEngine::new(
                Arc::new(SqlEventLogRepository::new(pool.clone())),
                Arc::new(SqlEntityStore::new(pool.clone())),
                Arc::new(SystemClock),
                batch_size.unwrap_or(config.processor.batch_size),
            );
            let report = engine.run_batch().await;
            pool.close().await;
            report.map_err(|error| (error.error_class(), error.to_string(), 6u8))
        })
    });

    match result {
        Ok(report) if report.aborted => CommandResult::failure(
            "process",
            "storage_unavailable",
            summary(&report),
            6,
        ),
        Ok(report) => CommandResult::success_with("process", summary(&report), &report),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("process", error_class, message, exit_code)
        }
    }
}

fn summary(report: &BatchReport) -> String {
    format!(
        "processed {} of {} pending events ({} no-op, {} skipped, {} failed)",
        report.processed, report.selected, report.noop, report.skipped, report.failed
    )
}
