use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::ConversionRule;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub crm: CrmConfig,
    pub processor: ProcessorConfig,
    pub dispatch: DispatchConfig,
    pub classifier: ClassifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub auth_url: String,
    pub api_base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub token_expiry_margin_secs: i64,
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub batch_size: u32,
    pub interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
}

/// Ordered classifier rules. Empty means the built-in list.
#[derive(Clone, Debug, Default)]
pub struct ClassifierConfig {
    pub rules: Vec<ConversionRule>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub crm_enabled: Option<bool>,
    pub crm_client_id: Option<String>,
    pub crm_client_secret: Option<String>,
    pub crm_refresh_token: Option<String>,
    pub crm_auth_url: Option<String>,
    pub crm_api_base_url: Option<String>,
    pub processor_batch_size: Option<u32>,
    pub processor_interval_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://billsync.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 3000,
                graceful_shutdown_secs: 15,
            },
            crm: CrmConfig {
                enabled: false,
                client_id: None,
                client_secret: None,
                refresh_token: None,
                auth_url: "https://api.rd.services/auth/token".to_string(),
                api_base_url: "https://api.rd.services".to_string(),
                timeout_secs: 10,
                max_attempts: 3,
                base_delay_ms: 1_000,
                token_expiry_margin_secs: 60,
            },
            processor: ProcessorConfig { batch_size: 50, interval_secs: 60 },
            dispatch: DispatchConfig { queue_capacity: 256 },
            classifier: ClassifierConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("billsync.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(enabled) = crm.enabled {
                self.crm.enabled = enabled;
            }
            if let Some(client_id) = crm.client_id {
                self.crm.client_id = Some(client_id);
            }
            if let Some(crm_client_secret_value) = crm.client_secret {
                self.crm.client_secret = Some(secret_value(crm_client_secret_value));
            }
            if let Some(crm_refresh_token_value) = crm.refresh_token {
                self.crm.refresh_token = Some(secret_value(crm_refresh_token_value));
            }
            if let Some(auth_url) = crm.auth_url {
                self.crm.auth_url = auth_url;
            }
            if let Some(api_base_url) = crm.api_base_url {
                self.crm.api_base_url = api_base_url;
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
            if let Some(max_attempts) = crm.max_attempts {
                self.crm.max_attempts = max_attempts;
            }
            if let Some(base_delay_ms) = crm.base_delay_ms {
                self.crm.base_delay_ms = base_delay_ms;
            }
            if let Some(token_expiry_margin_secs) = crm.token_expiry_margin_secs {
                self.crm.token_expiry_margin_secs = token_expiry_margin_secs;
            }
        }

        if let Some(processor) = patch.processor {
            if let Some(batch_size) = processor.batch_size {
                self.processor.batch_size = batch_size;
            }
            if let Some(interval_secs) = processor.interval_secs {
                self.processor.interval_secs = interval_secs;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(queue_capacity) = dispatch.queue_capacity {
                self.dispatch.queue_capacity = queue_capacity;
            }
        }

        if let Some(classifier) = patch.classifier {
            if let Some(rules) = classifier.rules {
                self.classifier.rules = rules;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BILLSYNC_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("BILLSYNC_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("BILLSYNC_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("BILLSYNC_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("BILLSYNC_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BILLSYNC_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        let port = read_env("BILLSYNC_SERVER_PORT").or_else(|| read_env("PORT"));
        if let Some(value) = port {
            self.server.port = parse_u16("BILLSYNC_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("BILLSYNC_CRM_ENABLED") {
            self.crm.enabled = parse_bool("BILLSYNC_CRM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("BILLSYNC_CRM_CLIENT_ID") {
            self.crm.client_id = Some(value);
        }
        if let Some(value) = read_env("BILLSYNC_CRM_CLIENT_SECRET") {
            self.crm.client_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("BILLSYNC_CRM_REFRESH_TOKEN") {
            self.crm.refresh_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("BILLSYNC_CRM_AUTH_URL") {
            self.crm.auth_url = value;
        }
        if let Some(value) = read_env("BILLSYNC_CRM_API_BASE_URL") {
            self.crm.api_base_url = value;
        }
        if let Some(value) = read_env("BILLSYNC_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("BILLSYNC_CRM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("BILLSYNC_CRM_MAX_ATTEMPTS") {
            self.crm.max_attempts = parse_u32("BILLSYNC_CRM_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("BILLSYNC_CRM_BASE_DELAY_MS") {
            self.crm.base_delay_ms = parse_u64("BILLSYNC_CRM_BASE_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("BILLSYNC_PROCESSOR_BATCH_SIZE") {
            self.processor.batch_size = parse_u32("BILLSYNC_PROCESSOR_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("BILLSYNC_PROCESSOR_INTERVAL_SECS") {
            self.processor.interval_secs = parse_u64("BILLSYNC_PROCESSOR_INTERVAL_SECS", &value)?;
        }

        let log_level =
            read_env("BILLSYNC_LOGGING_LEVEL").or_else(|| read_env("BILLSYNC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("BILLSYNC_LOGGING_FORMAT").or_else(|| read_env("BILLSYNC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.crm_enabled {
            self.crm.enabled = enabled;
        }
        if let Some(client_id) = overrides.crm_client_id {
            self.crm.client_id = Some(client_id);
        }
        if let Some(client_secret) = overrides.crm_client_secret {
            self.crm.client_secret = Some(secret_value(client_secret));
        }
        if let Some(refresh_token) = overrides.crm_refresh_token {
            self.crm.refresh_token = Some(secret_value(refresh_token));
        }
        if let Some(auth_url) = overrides.crm_auth_url {
            self.crm.auth_url = auth_url;
        }
        if let Some(api_base_url) = overrides.crm_api_base_url {
            self.crm.api_base_url = api_base_url;
        }
        if let Some(batch_size) = overrides.processor_batch_size {
            self.processor.batch_size = batch_size;
        }
        if let Some(interval_secs) = overrides.processor_interval_secs {
            self.processor.interval_secs = interval_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_crm(&self.crm)?;
        validate_processor(&self.processor, &self.dispatch)?;
        validate_classifier(&self.classifier)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("billsync.toml"), PathBuf::from("config/billsync.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    for (key, url) in [("crm.auth_url", &crm.auth_url), ("crm.api_base_url", &crm.api_base_url)] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{key} must start with http:// or https://"
            )));
        }
    }

    if crm.timeout_secs == 0 || crm.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "crm.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if crm.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "crm.max_attempts must be greater than zero".to_string(),
        ));
    }

    if !(0..=3_600).contains(&crm.token_expiry_margin_secs) {
        return Err(ConfigError::Validation(
            "crm.token_expiry_margin_secs must be in range 0..=3600".to_string(),
        ));
    }

    if crm.enabled {
        let has_client_id =
            crm.client_id.as_ref().map(|value| !value.trim().is_empty()).unwrap_or(false);
        if !has_client_id {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.client_id is not configured".to_string(),
            ));
        }

        let has_secret = crm
            .client_secret
            .as_ref()
            .map(|value| !value.expose_secret().trim().is_empty())
            .unwrap_or(false);
        if !has_secret {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.client_secret is missing".to_string(),
            ));
        }

        let has_refresh_token = crm
            .refresh_token
            .as_ref()
            .map(|value| !value.expose_secret().trim().is_empty())
            .unwrap_or(false);
        if !has_refresh_token {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.refresh_token is missing".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_processor(
    processor: &ProcessorConfig,
    dispatch: &DispatchConfig,
) -> Result<(), ConfigError> {
    if processor.batch_size == 0 || processor.batch_size > 1_000 {
        return Err(ConfigError::Validation(
            "processor.batch_size must be in range 1..=1000".to_string(),
        ));
    }

    if processor.interval_secs == 0 {
        return Err(ConfigError::Validation(
            "processor.interval_secs must be greater than zero".to_string(),
        ));
    }

    if dispatch.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "dispatch.queue_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_classifier(classifier: &ClassifierConfig) -> Result<(), ConfigError> {
    if let Some(position) = classifier
        .rules
        .iter()
        .position(|rule| rule.term.trim().is_empty() || rule.campaign.trim().is_empty())
    {
        return Err(ConfigError::Validation(format!(
            "classifier.rules[{position}] needs a non-empty term and campaign"
        )));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    crm: Option<CrmPatch>,
    processor: Option<ProcessorPatch>,
    dispatch: Option<DispatchPatch>,
    classifier: Option<ClassifierPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    auth_url: Option<String>,
    api_base_url: Option<String>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    token_expiry_margin_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessorPatch {
    batch_size: Option<u32>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassifierPatch {
    rules: Option<Vec<ConversionRule>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_without_any_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.processor.batch_size == 50, "default batch size should be 50")?;
        ensure(config.processor.interval_secs == 60, "default interval should be 60s")?;
        ensure(config.crm.max_attempts == 3, "default dispatch ceiling should be 3")?;
        ensure(!config.crm.enabled, "crm should be disabled by default")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation_and_classifier_rules() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CRM_CLIENT_SECRET", "secret-from-env");
        env::set_var("TEST_CRM_REFRESH_TOKEN", "refresh-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("billsync.toml");
            fs::write(
                &path,
                r#"
[crm]
enabled = true
client_id = "client-1"
client_secret = "${TEST_CRM_CLIENT_SECRET}"
refresh_token = "${TEST_CRM_REFRESH_TOKEN}"

[[classifier.rules]]
term = "cardio"
campaign = "Pós-graduação Cardio"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let secret = config.crm.client_secret.as_ref().map(|s| s.expose_secret().to_string());
            ensure(
                secret.as_deref() == Some("secret-from-env"),
                "client secret should be interpolated from environment",
            )?;
            let refresh = config.crm.refresh_token.as_ref().map(|s| s.expose_secret().to_string());
            ensure(
                refresh.as_deref() == Some("refresh-from-env"),
                "refresh token should be interpolated from environment",
            )?;
            ensure(config.classifier.rules.len() == 1, "classifier rules should be loaded")?;
            Ok(())
        })();

        clear_vars(&["TEST_CRM_CLIENT_SECRET", "TEST_CRM_REFRESH_TOKEN"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BILLSYNC_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("BILLSYNC_PROCESSOR_BATCH_SIZE", "25");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("billsync.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[processor]
batch_size = 10
interval_secs = 30

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.processor.batch_size == 25, "env batch size should win over file")?;
            ensure(config.processor.interval_secs == 30, "file interval should win over default")?;
            Ok(())
        })();

        clear_vars(&["BILLSYNC_DATABASE_URL", "BILLSYNC_PROCESSOR_BATCH_SIZE"]);
        result
    }

    #[test]
    fn enabled_crm_without_credentials_fails_fast() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                crm_enabled: Some(true),
                crm_client_id: Some("client-1".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };

        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("crm.client_secret")
        );
        ensure(has_message, "validation failure should mention crm.client_secret")
    }

    #[test]
    fn zero_batch_size_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                processor_batch_size: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("batch_size")),
            "zero batch size should fail validation",
        )
    }

    #[test]
    fn token_expiry_margin_must_stay_within_an_hour() -> Result<(), String> {
        let mut config = AppConfig::default();
        config.crm.token_expiry_margin_secs = i64::MAX;

        ensure(
            matches!(
                config.validate(),
                Err(ConfigError::Validation(ref message)) if message.contains("token_expiry_margin_secs")
            ),
            "oversized expiry margin should fail validation",
        )?;

        config.crm.token_expiry_margin_secs = 3_600;
        ensure(config.validate().is_ok(), "an hour of margin should be accepted")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                crm_enabled: Some(true),
                crm_client_id: Some("client-1".to_string()),
                crm_client_secret: Some("very-secret-value".to_string()),
                crm_refresh_token: Some("refresh-secret-value".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;
        let debug = format!("{config:?}");

        ensure(!debug.contains("very-secret-value"), "debug output should not contain secret")?;
        ensure(
            !debug.contains("refresh-secret-value"),
            "debug output should not contain refresh token",
        )
    }
}
