//! # Postgres Unit Directory
//!
//! Looks up the units a user may observe in `user_units(user_id, unit_id)`
//! through a `deadpool_postgres` pool.

use async_trait::async_trait;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use super::ConnectionError;
use crate::directory::{DirectoryError, UnitDirectory, UserId};
use crate::models::UnitId;

const UNITS_FOR_USER: &str = "SELECT unit_id FROM user_units WHERE user_id = $1 ORDER BY unit_id";

pub struct PostgresUnitDirectory {
    pool: Pool,
}

impl PostgresUnitDirectory {
    /// Builds the pool and checks out one connection so a bad URL fails at startup.
    pub async fn connect(database_url: &str) -> Result<Self, ConnectionError> {
        let mut pg_pool_config = DeadpoolConfig::new();
        pg_pool_config.url = Some(database_url.to_string());
        pg_pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = pg_pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let directory = Self { pool };
        directory.ping().await?;
        info!("Database connection pool created successfully.");
        Ok(directory)
    }

    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ConnectionError::Database(e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ConnectionError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl UnitDirectory for PostgresUnitDirectory {
    async fn units_for(&self, user_id: UserId) -> Result<Vec<UnitId>, DirectoryError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DirectoryError::Backend(e.to_string()))?;

        let rows = client
            .query(UNITS_FOR_USER, &[&user_id])
            .await
            .map_err(|e| DirectoryError::Backend(e.to_string()))?;

        let units = rows
            .iter()
            .map(|row| row.try_get::<_, i64>(0))
            .collect::<Result<Vec<UnitId>, _>>()
            .map_err(|e| DirectoryError::Backend(e.to_string()))?;

        debug!(user_id, units = units.len(), "Units loaded from database");
        Ok(units)
    }
}
