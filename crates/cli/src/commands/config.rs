use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source =
            field_source(field.key, field.env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }
    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    fn field(key: &'static str, env_keys: &'static [&'static str], value: String) -> Field {
        Field { key, env_keys, value }
    }
    let negotiation = &config.negotiation;
    vec![
        field("database.url", &["PARLEY_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["PARLEY_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["PARLEY_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field("llm.provider", &["PARLEY_LLM_PROVIDER"], config.llm.provider.as_str().to_string()),
        field("llm.model", &["PARLEY_LLM_MODEL"], config.llm.model.clone()),
        field(
            "llm.base_url",
            &["PARLEY_LLM_BASE_URL"],
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        field(
            "llm.api_key",
            &["PARLEY_LLM_API_KEY"],
            config
                .llm
                .api_key
                .as_ref()
                .map_or_else(|| "<unset>".to_string(), |key| redact_key(key.expose_secret())),
        ),
        field("llm.timeout_secs", &["PARLEY_LLM_TIMEOUT_SECS"], config.llm.timeout_secs.to_string()),
        field("llm.max_retries", &["PARLEY_LLM_MAX_RETRIES"], config.llm.max_retries.to_string()),
        field(
            "server.bind_address",
            &["PARLEY_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        field("server.port", &["PARLEY_SERVER_PORT"], config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            &["PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field(
            "logging.level",
            &["PARLEY_LOGGING_LEVEL", "PARLEY_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["PARLEY_LOGGING_FORMAT", "PARLEY_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
        ),
        field(
            "negotiation.follow_up_delay_hours",
            &["PARLEY_FOLLOW_UP_DELAY_HOURS"],
            negotiation.follow_up_delay_hours.to_string(),
        ),
        field(
            "negotiation.archetype_timeout_secs",
            &["PARLEY_ARCHETYPE_TIMEOUT_SECS"],
            negotiation.archetype_timeout_secs.to_string(),
        ),
        field(
            "negotiation.oracle_max_retries",
            &["PARLEY_ORACLE_MAX_RETRIES"],
            negotiation.oracle_max_retries.to_string(),
        ),
        field(
            "negotiation.oracle_backoff_millis",
            &["PARLEY_ORACLE_BACKOFF_MILLIS"],
            negotiation.oracle_backoff_millis.to_string(),
        ),
        field(
            "negotiation.ops_value_threshold",
            &["PARLEY_OPS_VALUE_THRESHOLD"],
            negotiation.ops_value_threshold.to_string(),
        ),
        field(
            "negotiation.worker_poll_interval_secs",
            &["PARLEY_WORKER_POLL_INTERVAL_SECS"],
            negotiation.worker_poll_interval_secs.to_string(),
        ),
        field(
            "negotiation.worker_batch_size",
            &["PARLEY_WORKER_BATCH_SIZE"],
            negotiation.worker_batch_size.to_string(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
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

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
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

/// Keeps a provider prefix such as `sk-` and hides the rest.
fn redact_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 8 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_key};

    #[test]
    fn api_keys_never_render_in_full() {
        assert_eq!(redact_key("sk-live-abcdef"), "sk-***");
        assert_eq!(redact_key("abcdef123456"), "<redacted>");
        assert_eq!(redact_key("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_config_documents() {
        let doc: toml::Value =
            "[negotiation]\nfollow_up_delay_hours = 24\n".parse().expect("valid toml");
        assert!(contains_path(&doc, "negotiation.follow_up_delay_hours"));
        assert!(!contains_path(&doc, "negotiation.worker_batch_size"));
    }
}
