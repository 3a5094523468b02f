use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::config::CoreConfig;
use crate::errors::Result;

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around the Postgres pool that backs the rule repository.
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<Postgres>,
}

impl DatabasePool {
    /// Establishes a new connection pool based on the core configuration.
    pub async fn connect(config: &CoreConfig) -> Result<Self> {
        let url = config.require_database_url()?;
        Self::connect_with_url(url).await
    }

    /// Establishes a connection pool directly from a database URL.
    pub async fn connect_with_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;

        info!(max_connections = MAX_CONNECTIONS, "connected to rule database");
        Ok(Self { pool })
    }

    /// Builds a pool that only connects on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    /// Round-trips a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_pool_does_not_connect_eagerly() {
        let pool = DatabasePool::connect_lazy("postgres://localhost/docrules")
            .expect("lazy pool should build without a server");
        assert_eq!(pool.inner().size(), 0);
    }

    #[tokio::test]
    async fn connect_requires_database_url() {
        let config = CoreConfig::default();
        let err = DatabasePool::connect(&config)
            .await
            .err()
            .expect("missing url must fail");
        assert!(err.to_string().contains("DOCRULES_DATABASE_URL"));
    }
}
