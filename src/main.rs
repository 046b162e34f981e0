//! multidb-repository - command-line entry point.
//!
//! Loads a connection registry and runs one command against a database code.

use clap::Parser;
use multidb_repository::config::{Command, Config};
use multidb_repository::{ConnectionRegistry, Mapper, QueryParam, RepositoryFactory};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Command-line parameters are JSON when they parse as JSON, text otherwise.
fn parse_param(raw: &str) -> QueryParam {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value) => QueryParam::from_json(value),
        Err(_) => QueryParam::String(raw.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        registry = %config.registry.display(),
        code = %config.code,
        "Starting multidb-repository v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = ConnectionRegistry::from_json_file(&config.registry)?;
    let factory = RepositoryFactory::with_sqlx(registry, Arc::new(Mapper::empty()));

    let result = async {
        let repository = factory.get_repository(&config.code).await?;
        match &config.command {
            Command::Check => {
                let version = repository.client().server_version().await;
                println!(
                    "{}",
                    serde_json::json!({
                        "code": repository.code(),
                        "dbType": repository.db_type(),
                        "serverVersion": version,
                    })
                );
            }
            Command::Query { sql, params } => {
                let params = params.iter().map(|p| parse_param(p)).collect();
                let rows = repository.query_table(sql, params).await?;
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            Command::Execute { sql, params } => {
                let params = params.iter().map(|p| parse_param(p)).collect();
                let rows_affected = repository.execute_raw(sql, params).await?;
                println!("{}", serde_json::json!({ "rowsAffected": rows_affected }));
            }
        }
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    factory.close_all().await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
