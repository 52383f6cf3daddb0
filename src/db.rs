//! Database pool management and schema bootstrap.
//!
//! The schema is created idempotently from the entity definitions at startup,
//! including the partial unique index enforcing the connection natural key
//! over live rows.

use anyhow::{Context, Result};
use sea_orm::sea_query::{ConditionalStatement, Expr, Index, IndexCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema,
};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;
use crate::models::{
    connection, encryption_checkpoint, oauth_session, provider_config, refresh_lock,
};

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Initialize the connection pool with retry and exponential backoff.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "database URL cannot be empty".to_string(),
        }
        .into());
    }

    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let max_retries = 5;
    let mut retry_delay = Duration::from_millis(100);

    for attempt in 1..=max_retries {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("connected to database (attempt {})", attempt);
                return Ok(conn);
            }
            Err(e) if attempt < max_retries => {
                log::warn!(
                    "database connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    retry_delay
                );
                sleep(retry_delay).await;
                retry_delay *= 2;
            }
            Err(e) => {
                log::error!("failed to connect to database after {} attempts: {}", max_retries, e);
                return Err(DatabaseError::ConnectionFailed { source: e }.into());
            }
        }
    }

    unreachable!("retry loop always returns")
}

/// Verify the connection is alive.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    use sea_orm::Statement;

    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("database health check failed")?;

    Ok(())
}

/// Create all tables and indexes if they do not exist yet.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    create_table(db, &schema, connection::Entity).await?;
    create_table(db, &schema, provider_config::Entity).await?;
    create_table(db, &schema, oauth_session::Entity).await?;
    create_table(db, &schema, encryption_checkpoint::Entity).await?;
    create_table(db, &schema, refresh_lock::Entity).await?;

    // Natural-key uniqueness holds over live rows only; soft-deleted rows
    // keep their history without blocking re-creation.
    let natural_key: IndexCreateStatement = Index::create()
        .name("idx_connections_natural_key")
        .table(connection::Entity)
        .col(connection::Column::ConnectionId)
        .col(connection::Column::ProviderConfigKey)
        .col(connection::Column::EnvironmentId)
        .unique()
        .if_not_exists()
        .and_where(Expr::col(connection::Column::Deleted).eq(false))
        .to_owned();
    db.execute(backend.build(&natural_key))
        .await
        .context("failed to create connections natural key index")?;

    let provider_key = Index::create()
        .name("idx_provider_configs_env_key")
        .table(provider_config::Entity)
        .col(provider_config::Column::EnvironmentId)
        .col(provider_config::Column::UniqueKey)
        .unique()
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&provider_key))
        .await
        .context("failed to create provider config key index")?;

    Ok(())
}

async fn create_table<E: EntityTrait>(
    db: &DatabaseConnection,
    schema: &Schema,
    entity: E,
) -> Result<()> {
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(db.get_database_backend().build(&stmt))
        .await
        .with_context(|| format!("failed to create table for {:?}", entity.table_name()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_database_url_is_rejected() {
        let config = AppConfig {
            database_url: String::new(),
            ..AppConfig::default()
        };

        let result = init_pool(&config).await;
        assert!(matches!(
            result.unwrap_err().downcast::<DatabaseError>(),
            Ok(DatabaseError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
        health_check(&db).await.unwrap();
    }
}
