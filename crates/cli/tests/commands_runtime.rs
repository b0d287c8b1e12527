use std::env;
use std::sync::{Mutex, OnceLock};

use parley_cli::commands::{doctor, migrate, seed, simulate};
use serde_json::Value;

const IN_MEMORY_DB: &[(&str, &str)] =
    &[("PARLEY_DATABASE_URL", "sqlite::memory:"), ("PARLEY_DATABASE_MAX_CONNECTIONS", "1")];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(IN_MEMORY_DB, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().starts_with("applied "));
    });
}

#[test]
fn migrate_returns_config_failure_for_openai_without_key() {
    with_env(&[("PARLEY_LLM_PROVIDER", "openai")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_lists_every_demo_scenario() {
    with_env(IN_MEMORY_DB, || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");

        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("  - auto-send: T-DEMO-AUTOSEND"));
        assert!(message.contains("  - sandbox: T-DEMO-SANDBOX"));
        assert!(message.contains("  - halt: T-DEMO-HALT"));
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    with_env(IN_MEMORY_DB, || {
        let first = parse_payload(&seed::run().output);
        let second = parse_payload(&seed::run().output);

        assert_eq!(first["status"], "ok");
        assert_eq!(second["status"], "ok");
        assert_eq!(first["message"], second["message"]);
    });
}

#[test]
fn simulate_reports_each_demo_thread() {
    with_env(&[], || {
        let result = simulate::run(None);
        assert_eq!(result.exit_code, 0, "expected simulation success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "simulate");
        let threads = payload["threads"].as_array().expect("threads array");
        assert_eq!(threads.len(), 3);

        let halt = threads
            .iter()
            .find(|thread| thread["thread_id"] == "T-DEMO-HALT")
            .expect("halt thread reported");
        assert_eq!(halt["decision_type"], "HALT");
        assert_eq!(halt["final_stage"], "halted");
        assert!(halt["delivery"].is_null());
        assert!(threads.iter().all(|thread| thread["chain_valid"] == true));
    });
}

#[test]
fn simulate_filters_to_one_thread() {
    with_env(&[], || {
        let result = simulate::run(Some("T-DEMO-SANDBOX"));
        assert_eq!(result.exit_code, 0, "expected simulation success: {}", result.output);

        let payload = parse_payload(&result.output);
        let threads = payload["threads"].as_array().expect("threads array");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0]["delivery"], "drafted");
    });
}

#[test]
fn simulate_rejects_unknown_thread() {
    with_env(&[], || {
        let result = simulate::run(Some("T-UNKNOWN"));
        assert_eq!(result.exit_code, 4);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "simulation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("T-UNKNOWN"));
    });
}

#[test]
fn doctor_flags_unmigrated_database() {
    with_env(IN_MEMORY_DB, || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        let checks = payload["checks"].as_array().expect("checks array");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("llm_client"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("schema_migrations"), "fail");
    });
}

#[test]
fn doctor_skips_downstream_checks_when_config_is_invalid() {
    with_env(&[("PARLEY_LLM_PROVIDER", "anthropic")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        let checks = payload["checks"].as_array().expect("checks array");
        assert_eq!(checks[0]["name"], "config_validation");
        assert_eq!(checks[0]["status"], "fail");
        assert!(checks[1..].iter().all(|check| check["status"] == "skipped"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PARLEY_DATABASE_URL",
        "PARLEY_DATABASE_MAX_CONNECTIONS",
        "PARLEY_DATABASE_TIMEOUT_SECS",
        "PARLEY_LLM_PROVIDER",
        "PARLEY_LLM_API_KEY",
        "PARLEY_LLM_BASE_URL",
        "PARLEY_LLM_MODEL",
        "PARLEY_LLM_TIMEOUT_SECS",
        "PARLEY_LLM_MAX_RETRIES",
        "PARLEY_SERVER_BIND_ADDRESS",
        "PARLEY_SERVER_PORT",
        "PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "PARLEY_LOGGING_LEVEL",
        "PARLEY_LOGGING_FORMAT",
        "PARLEY_LOG_LEVEL",
        "PARLEY_LOG_FORMAT",
        "PARLEY_FOLLOW_UP_DELAY_HOURS",
        "PARLEY_OPS_VALUE_THRESHOLD",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
