use billsync_db::{EventLogRepository, SqlEventLogRepository};

use crate::commands::{load_config, open_pool, runtime, CommandResult};

pub fn run() -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let counts = SqlEventLogRepository::new(pool.clone()).counts().await;
            pool.close().await;
            counts.map_err(|error| ("db_query", error.to_string(), 4u8))
        })
    });

    match result {
        Ok(counts) => CommandResult::success_with(
            "status",
            format!(
                "{} pending ({} failing), {} processed",
                counts.pending, counts.failing, counts.processed
            ),
            counts,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("status", error_class, message, exit_code)
        }
    }
}
