//! Postgres pool bootstrap: connect and ping with retry, then migrate.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::retry::retry_async;
use crate::store::postgres::map_sqlx_error;
use crate::store::StoreError;

/// Versioned schema for the `products` and `outbox` tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open the pool, retrying per `config.connect_retry`.
pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable("DATABASE_URL not configured".to_string()))?;

    let pool = retry_async(&config.connect_retry, "db_connect", move || async move {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))
    })
    .await?;

    info!(max_connections = config.max_connections, "database pool ready");
    Ok(pool)
}

/// Round-trip a trivial query until the database answers.
pub async fn ping_with_retry(pool: &PgPool, config: &DatabaseConfig) -> Result<(), StoreError> {
    retry_async(&config.connect_retry, "db_ping", move || async move {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("ping", e))
    })
    .await
}

/// Apply pending migrations. Applied versions are tracked in
/// `_sqlx_migrations`, so a pre-existing table with another shape fails here
/// instead of at the first claim.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await.map_err(map_migrate_error)?;
    info!("database migrations applied");
    Ok(())
}

fn map_migrate_error(err: MigrateError) -> StoreError {
    match err {
        MigrateError::Execute(e) => map_sqlx_error("migrate", e),
        other => StoreError::Query(format!("migrate: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_migration_creates_outbox_bookkeeping_columns() {
        let first = MIGRATOR.iter().next().unwrap();
        assert_eq!(first.version, 1);
        for needle in ["attempts", "last_error", "next_attempt_at", "idx_outbox_claim"] {
            assert!(first.sql.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn migrations_do_not_tolerate_foreign_tables() {
        for migration in MIGRATOR.iter() {
            assert!(
                !migration.sql.contains("IF NOT EXISTS"),
                "migration {} silently accepts existing objects",
                migration.version
            );
        }
    }
}
