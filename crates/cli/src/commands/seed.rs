use crate::commands::{block_on_current_thread, load_config, CommandResult};
use chrono::Utc;
use parley_db::{connect_with_settings, migrations, DemoSeedDataset, RepositorySet, ThreadSeedInfo};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on_current_thread("seed", async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let repositories = RepositorySet::sql(pool.clone());
        let seeded = DemoSeedDataset::load(&repositories, Utc::now())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoSeedDataset::verify(&repositories)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        pool.close().await;
        if verification.all_present {
            Ok(seeded.threads_seeded)
        } else {
            Err(("seed_verification", verification_message(&verification.checks), 6u8))
        }
    });

    match result {
        Ok(Ok(threads)) => CommandResult::success("seed", success_message(&threads)),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
        Err(failure) => failure,
    }
}

fn success_message(threads: &[ThreadSeedInfo]) -> String {
    let lines: Vec<String> = threads
        .iter()
        .map(|thread| format!("  - {}: {} ({})", thread.scenario, thread.thread_id, thread.description))
        .collect();
    format!("demo dataset loaded for {} negotiation threads:\n{}", threads.len(), lines.join("\n"))
}

fn verification_message(checks: &[(&'static str, bool)]) -> String {
    let failed: Vec<&str> =
        checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect();
    if failed.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_failed_checks() {
        let checks = [("T-DEMO-AUTOSEND", true), ("talent-ben", false), ("halt", false)];
        assert_eq!(verification_message(&checks), "seed verification failed for checks: talent-ben, halt");
    }

    #[test]
    fn verification_message_falls_back_when_nothing_is_labelled() {
        assert_eq!(verification_message(&[("auto-send", true)]), "some seed data failed to load");
    }
}
