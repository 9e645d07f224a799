use std::sync::Arc;
use std::time::Duration;

use billsync_core::classifier::ConversionClassifier;
use billsync_core::clock::{Clock, SystemClock};
use billsync_core::config::{AppConfig, ConfigError, CrmConfig, LoadOptions};
use billsync_crm::http::build_client;
use billsync_crm::{
    ConversionDispatcher, CrmError, CrmTokenCache, HttpCrmTransport, HttpTokenExchanger,
    RetryPolicy,
};
use billsync_db::{
    connect_with_settings, migrations, DbPool, SqlEntityStore, SqlEventLogRepository,
};
use thiserror::Error;
use tracing::info;

use crate::dispatch_queue::DispatchQueue;
use crate::health::HealthState;
use crate::processor::ReconciliationEngine;
use crate::webhook::WebhookState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub events: Arc<SqlEventLogRepository>,
    pub entities: Arc<SqlEntityStore>,
    pub classifier: Arc<ConversionClassifier>,
    pub clock: Arc<dyn Clock>,
    /// `None` when CRM delivery is disabled.
    pub dispatcher: Option<Arc<ConversionDispatcher>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("crm client setup failed: {0}")]
    Crm(#[source] CrmError),
    #[error("crm is enabled but `{0}` is not configured")]
    MissingCrmSetting(&'static str),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let classifier = Arc::new(if config.classifier.rules.is_empty() {
        ConversionClassifier::default()
    } else {
        ConversionClassifier::new(config.classifier.rules.clone())
    });
    let dispatcher = build_dispatcher(&config.crm, Arc::clone(&clock))?.map(Arc::new);
    info!(
        event_name = "system.bootstrap.crm_configured",
        correlation_id = "bootstrap",
        crm_enabled = dispatcher.is_some(),
        classifier_rules = classifier.rule_count(),
        "conversion delivery configured"
    );

    Ok(Application {
        events: Arc::new(SqlEventLogRepository::new(db_pool.clone())),
        entities: Arc::new(SqlEntityStore::new(db_pool.clone())),
        config,
        db_pool,
        classifier,
        clock,
        dispatcher,
    })
}

pub fn build_dispatcher(
    crm: &CrmConfig,
    clock: Arc<dyn Clock>,
) -> Result<Option<ConversionDispatcher>, BootstrapError> {
    if !crm.enabled {
        return Ok(None);
    }

    let client_id =
        crm.client_id.clone().ok_or(BootstrapError::MissingCrmSetting("crm.client_id"))?;
    let client_secret =
        crm.client_secret.clone().ok_or(BootstrapError::MissingCrmSetting("crm.client_secret"))?;
    let refresh_token =
        crm.refresh_token.clone().ok_or(BootstrapError::MissingCrmSetting("crm.refresh_token"))?;

    let client =
        build_client(Duration::from_secs(crm.timeout_secs.max(1))).map_err(BootstrapError::Crm)?;
    let exchanger =
        HttpTokenExchanger::new(client.clone(), &crm.auth_url, client_id, client_secret);
    let tokens = CrmTokenCache::new(
        Arc::new(exchanger),
        clock,
        refresh_token,
        chrono::Duration::seconds(crm.token_expiry_margin_secs.clamp(0, 3_600)),
    );
    let transport = HttpCrmTransport::new(client, &crm.api_base_url);

    Ok(Some(ConversionDispatcher::new(
        Arc::new(transport),
        Arc::new(tokens),
        RetryPolicy {
            max_attempts: crm.max_attempts,
            base_delay_ms: crm.base_delay_ms,
            ..RetryPolicy::default()
        },
    )))
}

impl Application {
    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.events.clone(),
            self.entities.clone(),
            Arc::clone(&self.clock),
            self.config.processor.batch_size,
        )
    }

    pub fn webhook_state(&self, dispatch: Option<DispatchQueue>) -> WebhookState {
        WebhookState {
            events: self.events.clone(),
            classifier: Arc::clone(&self.classifier),
            clock: Arc::clone(&self.clock),
            dispatch,
        }
    }

    pub fn health_state(&self) -> HealthState {
        HealthState { db_pool: self.db_pool.clone(), events: self.events.clone() }
    }
}

#[cfg(test)]
mod tests {
    use billsync_core::config::{ConfigOverrides, LoadOptions};
    use tempfile::TempDir;

    use crate::bootstrap::bootstrap;

    fn overrides(dir: &TempDir) -> ConfigOverrides {
        let path = dir.path().join("billsync.db");
        ConfigOverrides {
            database_url: Some(format!("sqlite://{}?mode=rwc", path.display())),
            ..ConfigOverrides::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_when_crm_credentials_are_missing() {
        let dir = TempDir::new().expect("tempdir");
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides { crm_enabled: Some(true), ..overrides(&dir) },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("crm.client_id"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_crm() {
        let dir = TempDir::new().expect("tempdir");
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                crm_enabled: Some(true),
                crm_client_id: Some("client".to_string()),
                crm_client_secret: Some("secret".to_string()),
                crm_refresh_token: Some("refresh".to_string()),
                ..overrides(&dir)
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('billing_event', 'customer', 'subscription', 'bill')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected tables to be available after bootstrap");
        assert_eq!(table_count, 4);
        assert!(app.dispatcher.is_some());

        let report = app.engine().run_batch().await.expect("empty batch");
        assert_eq!(report.selected, 0);

        app.db_pool.close().await;
    }
}
