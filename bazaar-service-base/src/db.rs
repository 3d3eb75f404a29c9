use bazaar_common::config::DbConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Postgres, Sqlite};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("invalid database uri: {0}")]
    InvalidUri(String),
    #[error("database connection failed: {0}")]
    Connection(String),
}

pub async fn create_postgres_pool(config: &DbConfig) -> Result<Pool<Postgres>, DbError> {
    if !config.is_postgres() {
        return Err(DbError::InvalidUri(format!(
            "expected a postgres:// uri, got scheme of {}",
            config.uri.split(':').next().unwrap_or("")
        )));
    }
    info!("DB pool: {}", redacted(&config.uri));
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.uri)
        .await
        .map_err(|e| DbError::Connection(e.to_string()))
}

pub async fn create_sqlite_pool(config: &DbConfig) -> Result<Pool<Sqlite>, DbError> {
    let path = config
        .uri
        .strip_prefix("sqlite://")
        .ok_or_else(|| DbError::InvalidUri("expected a sqlite:// uri".to_string()))?;
    info!("DB pool: sqlite://{path}");
    let options = SqliteConnectOptions::from_str(&config.uri)
        .map_err(|e| DbError::InvalidUri(e.to_string()))?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| DbError::Connection(e.to_string()))
}

fn redacted(uri: &str) -> String {
    match uri.rsplit_once('@') {
        Some((_, host)) => format!("postgres://****@{host}"),
        None => uri.to_string(),
    }
}
