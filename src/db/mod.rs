use crate::config::DatabaseConfig;
use crate::error::Error;
use anyhow::Result;
use repositories::{MemoryPatrolStore, PatrolStore, PgPatrolStore};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub mod migrations;
pub mod models;
pub mod repositories;

/// Database service for handling connections and migrations
pub struct DatabaseService {
    pub pool: Arc<PgPool>,
}

impl DatabaseService {
    /// Create a new database service
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing Database service");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

        info!("Connected to PostgreSQL database");

        let service = Self {
            pool: Arc::new(pool),
        };

        if config.auto_migrate {
            service.run_migrations().await?;
        }

        Ok(service)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        info!("Database migrations completed successfully");

        Ok(())
    }

    pub fn store(&self) -> Arc<dyn PatrolStore> {
        Arc::new(PgPatrolStore::new(self.pool.clone()))
    }
}

/// Open the record store selected by the configuration
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn PatrolStore>> {
    if config.in_memory {
        tracing::warn!("Using in-memory record store; records are lost on restart");
        return Ok(Arc::new(MemoryPatrolStore::new()));
    }

    let service = DatabaseService::new(config).await?;
    Ok(service.store())
}
