use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use billsync_core::config::AppConfig;
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::{load_config, CommandResult};

pub fn run() -> CommandResult {
    match load_config() {
        Ok(config) => CommandResult::success("config", render(&config)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("config", error_class, message, exit_code)
        }
    }
}

struct Sources {
    doc: Option<Value>,
    path: Option<PathBuf>,
}

impl Sources {
    fn detect() -> Self {
        let path = detect_config_path();
        let doc = load_config_file_doc(path.as_deref());
        Self { doc, path }
    }

    fn line(&self, key: &str, value: &str, env_keys: &[&str]) -> String {
        let source = field_source(key, env_keys, self.doc.as_ref(), self.path.as_deref());
        render_line(key, value, source)
    }
}

pub fn render(config: &AppConfig) -> String {
    let sources = Sources::detect();
    let crm = &config.crm;

    let lines = vec![
        "effective config (source precedence: env > file > default):".to_string(),
        sources.line("database.url", &config.database.url, &["BILLSYNC_DATABASE_URL"]),
        sources.line(
            "database.max_connections",
            &config.database.max_connections.to_string(),
            &["BILLSYNC_DATABASE_MAX_CONNECTIONS"],
        ),
        sources.line(
            "database.timeout_secs",
            &config.database.timeout_secs.to_string(),
            &["BILLSYNC_DATABASE_TIMEOUT_SECS"],
        ),
        sources.line(
            "server.bind_address",
            &config.server.bind_address,
            &["BILLSYNC_SERVER_BIND_ADDRESS"],
        ),
        sources.line(
            "server.port",
            &config.server.port.to_string(),
            &["BILLSYNC_SERVER_PORT", "PORT"],
        ),
        sources.line(
            "server.graceful_shutdown_secs",
            &config.server.graceful_shutdown_secs.to_string(),
            &[],
        ),
        sources.line("crm.enabled", &crm.enabled.to_string(), &["BILLSYNC_CRM_ENABLED"]),
        sources.line(
            "crm.client_id",
            crm.client_id.as_deref().unwrap_or("<unset>"),
            &["BILLSYNC_CRM_CLIENT_ID"],
        ),
        sources.line(
            "crm.client_secret",
            redact(crm.client_secret.as_ref()),
            &["BILLSYNC_CRM_CLIENT_SECRET"],
        ),
        sources.line(
            "crm.refresh_token",
            redact(crm.refresh_token.as_ref()),
            &["BILLSYNC_CRM_REFRESH_TOKEN"],
        ),
        sources.line("crm.auth_url", &crm.auth_url, &["BILLSYNC_CRM_AUTH_URL"]),
        sources.line("crm.api_base_url", &crm.api_base_url, &["BILLSYNC_CRM_API_BASE_URL"]),
        sources.line(
            "crm.max_attempts",
            &crm.max_attempts.to_string(),
            &["BILLSYNC_CRM_MAX_ATTEMPTS"],
        ),
        sources.line(
            "processor.batch_size",
            &config.processor.batch_size.to_string(),
            &["BILLSYNC_PROCESSOR_BATCH_SIZE"],
        ),
        sources.line(
            "processor.interval_secs",
            &config.processor.interval_secs.to_string(),
            &["BILLSYNC_PROCESSOR_INTERVAL_SECS"],
        ),
        sources.line(
            "dispatch.queue_capacity",
            &config.dispatch.queue_capacity.to_string(),
            &[],
        ),
        sources.line(
            "classifier.rules",
            &if config.classifier.rules.is_empty() {
                "<built-in>".to_string()
            } else {
                format!("{} rules", config.classifier.rules.len())
            },
            &[],
        ),
        sources.line(
            "logging.level",
            &config.logging.level,
            &["BILLSYNC_LOGGING_LEVEL", "BILLSYNC_LOG_LEVEL"],
        ),
        sources.line(
            "logging.format",
            &format!("{:?}", config.logging.format),
            &["BILLSYNC_LOGGING_FORMAT", "BILLSYNC_LOG_FORMAT"],
        ),
    ];

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("billsync.toml"), PathBuf::from("config/billsync.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact(secret: Option<&SecretString>) -> &'static str {
    match secret {
        Some(secret) if !secret.expose_secret().trim().is_empty() => "<redacted>",
        Some(_) => "<empty>",
        None => "<unset>",
    }
}
