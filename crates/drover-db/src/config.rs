//! Database configuration.

use anyhow::{Context, Result};

/// Connection configuration for the control-plane database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
}

impl DbConfig {
    /// Default local development URL.
    pub const DEFAULT_URL: &'static str = "postgresql://localhost:5432/drover";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Read `DROVER_DATABASE_URL`, falling back to the default URL.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DROVER_DATABASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_URL.to_string());
        Self { database_url }
    }

    /// The database name component of the URL.
    pub fn database_name(&self) -> Result<&str> {
        let after_slash = self
            .database_url
            .rfind('/')
            .map(|pos| &self.database_url[pos + 1..])
            .context("database URL has no path component")?;
        let name = after_slash.split('?').next().unwrap_or(after_slash);
        if name.is_empty() {
            anyhow::bail!("database URL has an empty database name");
        }
        Ok(name)
    }

    /// URL pointing at the `postgres` maintenance database on the same
    /// server, used for `CREATE DATABASE`.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => format!("{}/postgres", &self.database_url[..pos]),
            None => self.database_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_from_url() {
        let config = DbConfig::new("postgresql://localhost:5432/drover");
        assert_eq!(config.database_name().unwrap(), "drover");
    }

    #[test]
    fn database_name_strips_query_params() {
        let config = DbConfig::new("postgresql://localhost:5432/drover?sslmode=disable");
        assert_eq!(config.database_name().unwrap(), "drover");
    }

    #[test]
    fn empty_database_name_errors() {
        let config = DbConfig::new("postgresql://localhost:5432/");
        assert!(config.database_name().is_err());
    }

    #[test]
    fn maintenance_url_swaps_database() {
        let config = DbConfig::new("postgresql://user:pw@db:5432/drover");
        assert_eq!(
            config.maintenance_url(),
            "postgresql://user:pw@db:5432/postgres"
        );
    }
}
