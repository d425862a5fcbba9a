///! Database layer using SQLite
///!
///! Provides persistent storage for clusters, nodes and the host directory mirror.

pub mod migrations;

use shoal_common::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

pub(crate) fn db_error(context: &str, e: sqlx::Error) -> shoal_common::Error {
    shoal_common::Error::Database(format!("{}: {}", context, e))
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    shoal_common::Error::System(format!("Failed to create DB directory: {}", e))
                })?;
            }
        }

        let url = if database_url.contains('?') {
            database_url.to_string()
        } else {
            format!("{}?mode=rwc", database_url)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&url)
            .await
            .map_err(|e| db_error("Database connection failed", e))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("In-memory database failed", e))?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }
}

/// Host directory mirror operations
pub mod hosts {
    use super::*;
    use chrono::{DateTime, Utc};
    use shoal_common::HostInfo;
    use sqlx::Row;

    pub async fn get_host(pool: &SqlitePool, id: i64) -> Result<Option<HostInfo>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_error("Failed to load host", e))?;

        row.as_ref().map(row_to_host).transpose()
    }

    pub async fn upsert_host(pool: &SqlitePool, host: &HostInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO hosts (id, name, category, ip_address, agent_id, agent_status, last_heartbeat)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                ip_address = excluded.ip_address,
                agent_id = excluded.agent_id,
                agent_status = excluded.agent_status,
                last_heartbeat = excluded.last_heartbeat",
        )
        .bind(host.id)
        .bind(&host.name)
        .bind(host.category.as_str())
        .bind(&host.ip_address)
        .bind(&host.agent_id)
        .bind(host.agent_status.as_str())
        .bind(host.last_heartbeat)
        .execute(pool)
        .await
        .map_err(|e| db_error("Failed to save host", e))?;

        Ok(())
    }

    pub async fn record_heartbeat(pool: &SqlitePool, id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE hosts SET last_heartbeat = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_error("Failed to record heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(shoal_common::Error::HostNotFound(id));
        }

        Ok(())
    }

    fn row_to_host(row: &sqlx::sqlite::SqliteRow) -> Result<HostInfo> {
        let category: String = row.get("category");
        let agent_status: String = row.get("agent_status");

        Ok(HostInfo {
            id: row.get("id"),
            name: row.get("name"),
            category: category.parse()?,
            ip_address: row.get("ip_address"),
            agent_id: row.get("agent_id"),
            agent_status: agent_status.parse()?,
            last_heartbeat: row.get("last_heartbeat"),
        })
    }
}
