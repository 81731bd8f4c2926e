//! Connection management: pool construction with a startup probe, embedded
//! migrations, and first-run database bootstrap.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;

/// SQLSTATE raised by `CREATE DATABASE` when the database already exists.
const DUPLICATE_DATABASE: &str = "42P04";

/// Open the control-plane pool and probe it with a round trip.
///
/// An unreachable or misbehaving backend is a fatal startup error: it
/// surfaces here, before any component starts, rather than at the first
/// repository call.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!(
                "control-plane database unreachable at {}",
                config.database_url
            )
        })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("control-plane database failed the startup probe")?;

    Ok(pool)
}

/// Run all pending migrations embedded from `migrations/`.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied successfully");
    Ok(())
}

/// Check that `name` is safe to splice into DDL.
///
/// `CREATE DATABASE` takes no bind parameters, so anything interpolated
/// into it must be a plain identifier: a leading letter or underscore,
/// then letters, digits, and underscores.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("{name:?} is not a plain SQL identifier");
    }
    Ok(name)
}

/// Create the configured database on first run.
///
/// Issues `CREATE DATABASE` against the server's maintenance database and
/// treats the duplicate-database error as success, so two starting
/// orchestrators cannot race a lookup-then-create window.
pub async fn ensure_database(config: &DbConfig) -> Result<()> {
    let name = validate_identifier(config.database_name()?)?;

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.maintenance_url())
        .await
        .with_context(|| {
            format!(
                "maintenance database unreachable at {}",
                config.maintenance_url()
            )
        })?;

    let ddl = format!("CREATE DATABASE {name}");
    let outcome = admin.execute(ddl.as_str()).await;
    admin.close().await;

    match outcome {
        Ok(_) => {
            info!(db = name, "created control-plane database");
            Ok(())
        }
        Err(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(DUPLICATE_DATABASE) =>
        {
            debug!(db = name, "control-plane database already present");
            Ok(())
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("could not create database {name}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_pass() {
        assert_eq!(validate_identifier("drover").unwrap(), "drover");
        assert_eq!(validate_identifier("drover_test_01").unwrap(), "drover_test_01");
        assert_eq!(validate_identifier("_scratch").unwrap(), "_scratch");
    }

    #[test]
    fn hostile_identifiers_fail() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1drover").is_err());
        assert!(validate_identifier("drover;DROP TABLE workers").is_err());
        assert!(validate_identifier("drover-db").is_err());
        assert!(validate_identifier("drover db").is_err());
        assert!(validate_identifier("\"drover\"").is_err());
    }
}
