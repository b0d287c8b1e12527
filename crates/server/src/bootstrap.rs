use std::sync::Arc;

use parley_agent::llm::{HttpLlmClient, LlmError};
use parley_agent::oracle::LlmOracle;
use parley_agent::ports::{TracingMailTransport, TracingOpsNotifier};
use parley_agent::runtime::NegotiationRuntime;
use parley_core::config::{AppConfig, ConfigError};
#[cfg(test)]
use parley_core::config::LoadOptions;
use parley_db::{connect_with_settings, migrations, DbPool, RepositorySet};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<NegotiationRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    Llm(#[from] LlmError),
}

#[cfg(test)]
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

    let oracle = Arc::new(LlmOracle::new(Arc::new(HttpLlmClient::from_config(&config.llm)?)));
    info!(
        event_name = "system.bootstrap.llm_ready",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        "llm oracle configured"
    );

    let runtime = NegotiationRuntime::new(
        RepositorySet::sql(db_pool.clone()),
        oracle.clone(),
        oracle,
        Arc::new(TracingMailTransport),
        Arc::new(TracingOpsNotifier),
        &config.negotiation,
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}
