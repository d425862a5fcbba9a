///! Database migrations

use shoal_common::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| shoal_common::Error::Database(format!("Failed to create migrations table: {}", e)))?;

    // Run migrations in order
    run_migration(pool, "001_create_clusters_table", MIGRATION_001_CREATE_CLUSTERS).await?;
    run_migration(pool, "002_create_nodes_table", MIGRATION_002_CREATE_NODES).await?;
    run_migration(pool, "003_create_hosts_table", MIGRATION_003_CREATE_HOSTS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    // Check if migration already ran
    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| shoal_common::Error::Database(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| shoal_common::Error::Database(format!("Migration {} failed: {}", name, e)))?;

    sqlx::raw_sql(sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| shoal_common::Error::Database(format!("Migration {} failed: {}", name, e)))?;

    // Record migration
    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(|e| shoal_common::Error::Database(format!("Failed to record migration: {}", e)))?;

    tx.commit()
        .await
        .map_err(|e| shoal_common::Error::Database(format!("Migration {} failed: {}", name, e)))?;

    tracing::info!("Migration {} completed", name);

    Ok(())
}

const MIGRATION_001_CREATE_CLUSTERS: &str = "
CREATE TABLE clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    deployment_mode TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    install_dir TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX idx_clusters_status ON clusters(status);
CREATE INDEX idx_clusters_mode ON clusters(deployment_mode);
";

const MIGRATION_002_CREATE_NODES: &str = "
CREATE TABLE nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL,
    host_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    install_dir TEXT NOT NULL,
    membership_port INTEGER NOT NULL,
    api_port INTEGER,
    worker_port INTEGER,
    status TEXT NOT NULL,
    process_id INTEGER,
    last_event_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE CASCADE,
    UNIQUE (cluster_id, host_id, role)
);

CREATE INDEX idx_nodes_cluster ON nodes(cluster_id);
CREATE INDEX idx_nodes_host ON nodes(host_id);
";

const MIGRATION_003_CREATE_HOSTS: &str = "
CREATE TABLE hosts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    agent_status TEXT NOT NULL DEFAULT 'not_installed',
    last_heartbeat TEXT
);

CREATE INDEX idx_hosts_agent ON hosts(agent_id);
";
