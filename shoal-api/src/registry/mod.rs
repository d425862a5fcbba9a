//! Cluster and node registry
//!
//! Durable store for clusters and their nodes. Every uniqueness check runs in the
//! same SQLite transaction as the write it guards; the table constraints are the
//! backstop when two writers race past the check.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shoal_common::{
    Cluster, ClusterStatus, DeploymentMode, Error, Node, NodeRole, NodeStatus, Result,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::db::db_error;
use crate::validation::{
    validate_cluster_name, validate_install_dir, validate_node_ports, validate_role,
};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Request to create a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub install_dir: String,
}

/// Partial cluster update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateClusterRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Accepted only when equal to the current mode
    pub deployment_mode: Option<DeploymentMode>,
    pub version: Option<String>,
    pub config: Option<serde_json::Value>,
    pub install_dir: Option<String>,
}

/// Node admission request
///
/// Ports are taken as `u32` so out-of-range values surface as validation errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub host_id: i64,
    pub role: NodeRole,
    #[serde(default)]
    pub install_dir: Option<String>,
    pub membership_port: u32,
    #[serde(default)]
    pub api_port: Option<u32>,
    #[serde(default)]
    pub worker_port: Option<u32>,
}

/// Partial node update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateNodeRequest {
    pub role: Option<NodeRole>,
    pub install_dir: Option<String>,
    pub membership_port: Option<u32>,
    pub api_port: Option<u32>,
    pub worker_port: Option<u32>,
}

/// Cluster listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFilter {
    /// Substring match on the name
    pub name: Option<String>,
    pub status: Option<ClusterStatus>,
    pub mode: Option<DeploymentMode>,
    /// 1-based page number
    pub page: Option<u32>,
    pub size: Option<u32>,
}

/// One page of results plus the total match count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

/// SQLite-backed cluster/node store
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============== Clusters ==============

    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<Cluster> {
        let name = validate_cluster_name(&request.name)?;
        validate_install_dir(&request.install_dir)?;
        let config = request
            .config
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        let mut tx = self.pool.begin().await.map_err(|e| db_error("Failed to begin", e))?;

        if name_in_use(&mut tx, &name, None).await? {
            return Err(Error::ClusterNameDuplicate(name));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO clusters (name, description, deployment_mode, version, config, status,
             install_dir, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(&request.description)
        .bind(request.deployment_mode.as_str())
        .bind(&request.version)
        .bind(config.to_string())
        .bind(ClusterStatus::Created.as_str())
        .bind(&request.install_dir)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, || Error::ClusterNameDuplicate(name.clone()), "Failed to create cluster"))?;

        let id = result.last_insert_rowid();
        let cluster = fetch_cluster(&mut tx, id).await?;
        tx.commit().await.map_err(|e| db_error("Failed to commit", e))?;

        info!(cluster_id = id, name = %cluster.name, mode = %cluster.deployment_mode, "Cluster created");
        Ok(cluster)
    }

    pub async fn get_cluster(&self, id: i64) -> Result<Cluster> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load cluster", e))?
            .ok_or(Error::ClusterNotFound(id))?;

        row_to_cluster(&row)
    }

    pub async fn get_cluster_with_nodes(&self, id: i64) -> Result<(Cluster, Vec<Node>)> {
        let cluster = self.get_cluster(id).await?;
        let nodes = self.nodes_of(id).await?;
        Ok((cluster, nodes))
    }

    pub async fn list_clusters(&self, filter: &ClusterFilter) -> Result<Page<Cluster>> {
        let page = filter.page.unwrap_or(1).max(1);
        let size = filter.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut conditions = String::from(" WHERE 1=1");
        if filter.name.as_deref().is_some_and(|n| !n.is_empty()) {
            conditions.push_str(" AND instr(name, ?) > 0");
        }
        if filter.status.is_some() {
            conditions.push_str(" AND status = ?");
        }
        if filter.mode.is_some() {
            conditions.push_str(" AND deployment_mode = ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS count FROM clusters{}", conditions);
        let page_sql = format!(
            "SELECT * FROM clusters{} ORDER BY id LIMIT ? OFFSET ?",
            conditions
        );

        let mut count_query = sqlx::query(&count_sql);
        let mut page_query = sqlx::query(&page_sql);
        if let Some(name) = filter.name.as_deref().filter(|n| !n.is_empty()) {
            count_query = count_query.bind(name);
            page_query = page_query.bind(name);
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
            page_query = page_query.bind(status.as_str());
        }
        if let Some(mode) = filter.mode {
            count_query = count_query.bind(mode.as_str());
            page_query = page_query.bind(mode.as_str());
        }
        page_query = page_query
            .bind(size as i64)
            .bind(((page - 1) as i64) * size as i64);

        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count clusters", e))?
            .get("count");

        let rows = page_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list clusters", e))?;

        let items = rows.iter().map(row_to_cluster).collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            page,
            size,
        })
    }

    pub async fn update_cluster(&self, id: i64, request: UpdateClusterRequest) -> Result<Cluster> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("Failed to begin", e))?;
        let mut cluster = fetch_cluster(&mut tx, id).await?;

        if let Some(mode) = request.deployment_mode {
            if mode != cluster.deployment_mode {
                return Err(Error::Validation(format!(
                    "Deployment mode is fixed at creation ({}), cannot change to {}",
                    cluster.deployment_mode, mode
                )));
            }
        }

        if let Some(name) = request.name {
            let name = validate_cluster_name(&name)?;
            if name != cluster.name && name_in_use(&mut tx, &name, Some(id)).await? {
                return Err(Error::ClusterNameDuplicate(name));
            }
            cluster.name = name;
        }
        if let Some(install_dir) = request.install_dir {
            validate_install_dir(&install_dir)?;
            cluster.install_dir = install_dir;
        }
        if let Some(description) = request.description {
            cluster.description = description;
        }
        if let Some(version) = request.version {
            cluster.version = version;
        }
        if let Some(config) = request.config {
            cluster.config = config;
        }

        let name = cluster.name.clone();
        sqlx::query(
            "UPDATE clusters SET name = ?, description = ?, version = ?, config = ?,
             install_dir = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&cluster.name)
        .bind(&cluster.description)
        .bind(&cluster.version)
        .bind(cluster.config.to_string())
        .bind(&cluster.install_dir)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, || Error::ClusterNameDuplicate(name.clone()), "Failed to update cluster"))?;

        let cluster = fetch_cluster(&mut tx, id).await?;
        tx.commit().await.map_err(|e| db_error("Failed to commit", e))?;

        info!(cluster_id = id, "Cluster updated");
        Ok(cluster)
    }

    pub async fn update_cluster_status(&self, id: i64, status: ClusterStatus) -> Result<()> {
        let result = sqlx::query("UPDATE clusters SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update cluster status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::ClusterNotFound(id));
        }

        debug!(cluster_id = id, status = %status, "Cluster status updated");
        Ok(())
    }

    /// Delete a cluster and all of its nodes; returns the number of nodes removed
    pub async fn delete_cluster(&self, id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("Failed to begin", e))?;
        let cluster = fetch_cluster(&mut tx, id).await?;

        if cluster.status.blocks_deletion() {
            return Err(Error::ClusterBusy(id, cluster.status));
        }

        let removed = sqlx::query("DELETE FROM nodes WHERE cluster_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete nodes", e))?
            .rows_affected();

        sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete cluster", e))?;

        tx.commit().await.map_err(|e| db_error("Failed to commit", e))?;

        info!(cluster_id = id, nodes_removed = removed, "Cluster deleted");
        Ok(removed)
    }

    // ============== Nodes ==============

    pub async fn add_node(&self, cluster_id: i64, request: NewNode) -> Result<Node> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("Failed to begin", e))?;
        let cluster = fetch_cluster(&mut tx, cluster_id).await?;

        validate_role(cluster.deployment_mode, request.role)?;
        let ports = validate_node_ports(
            cluster.deployment_mode,
            request.role,
            request.membership_port,
            request.api_port,
            request.worker_port,
        )?;
        let install_dir = match request.install_dir.filter(|d| !d.is_empty()) {
            Some(dir) => {
                validate_install_dir(&dir)?;
                dir
            }
            None => cluster.install_dir.clone(),
        };

        let duplicate = || Error::NodeAlreadyExists {
            cluster_id,
            host_id: request.host_id,
            role: request.role,
        };

        if role_taken(&mut tx, cluster_id, request.host_id, request.role, None).await? {
            return Err(duplicate());
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO nodes (cluster_id, host_id, role, install_dir, membership_port, api_port,
             worker_port, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(request.host_id)
        .bind(request.role.as_str())
        .bind(&install_dir)
        .bind(ports.membership as i64)
        .bind(ports.api.map(i64::from))
        .bind(ports.worker.map(i64::from))
        .bind(NodeStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, duplicate, "Failed to add node"))?;

        let node = fetch_node(&mut tx, cluster_id, result.last_insert_rowid()).await?;
        tx.commit().await.map_err(|e| db_error("Failed to commit", e))?;

        info!(
            cluster_id,
            node_id = node.id,
            host_id = node.host_id,
            role = %node.role,
            "Node admitted"
        );
        Ok(node)
    }

    pub async fn get_node(&self, cluster_id: i64, node_id: i64) -> Result<Node> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        fetch_node(&mut conn, cluster_id, node_id).await
    }

    pub async fn list_nodes(&self, cluster_id: i64) -> Result<Vec<Node>> {
        // 404 for an unknown cluster rather than an empty list
        self.get_cluster(cluster_id).await?;
        self.nodes_of(cluster_id).await
    }

    async fn nodes_of(&self, cluster_id: i64) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE cluster_id = ? ORDER BY id")
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list nodes", e))?;

        rows.iter().map(row_to_node).collect()
    }

    pub async fn update_node(
        &self,
        cluster_id: i64,
        node_id: i64,
        request: UpdateNodeRequest,
    ) -> Result<Node> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("Failed to begin", e))?;
        let cluster = fetch_cluster(&mut tx, cluster_id).await?;
        let node = fetch_node(&mut tx, cluster_id, node_id).await?;

        let role = request.role.unwrap_or(node.role);
        validate_role(cluster.deployment_mode, role)?;
        let ports = validate_node_ports(
            cluster.deployment_mode,
            role,
            request.membership_port.unwrap_or(node.membership_port as u32),
            request.api_port.or(node.api_port.map(u32::from)),
            request.worker_port.or(node.worker_port.map(u32::from)),
        )?;
        let install_dir = match request.install_dir {
            Some(dir) => {
                validate_install_dir(&dir)?;
                dir
            }
            None => node.install_dir.clone(),
        };

        let duplicate = || Error::NodeAlreadyExists {
            cluster_id,
            host_id: node.host_id,
            role,
        };

        if role != node.role
            && role_taken(&mut tx, cluster_id, node.host_id, role, Some(node_id)).await?
        {
            return Err(duplicate());
        }

        sqlx::query(
            "UPDATE nodes SET role = ?, install_dir = ?, membership_port = ?, api_port = ?,
             worker_port = ?, updated_at = ? WHERE id = ?",
        )
        .bind(role.as_str())
        .bind(&install_dir)
        .bind(ports.membership as i64)
        .bind(ports.api.map(i64::from))
        .bind(ports.worker.map(i64::from))
        .bind(Utc::now())
        .bind(node_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, duplicate, "Failed to update node"))?;

        let node = fetch_node(&mut tx, cluster_id, node_id).await?;
        tx.commit().await.map_err(|e| db_error("Failed to commit", e))?;

        info!(cluster_id, node_id, "Node updated");
        Ok(node)
    }

    /// Record an observed node status; `process_id` is kept when not supplied
    pub async fn update_node_status(
        &self,
        node_id: i64,
        status: NodeStatus,
        process_id: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE nodes SET status = ?, process_id = COALESCE(?, process_id),
             last_event_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(process_id)
        .bind(now)
        .bind(now)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update node status", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id));
        }

        debug!(node_id, status = %status, "Node status updated");
        Ok(())
    }

    pub async fn delete_node(&self, cluster_id: i64, node_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ? AND cluster_id = ?")
            .bind(node_id)
            .bind(cluster_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete node", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id));
        }

        info!(cluster_id, node_id, "Node removed");
        Ok(())
    }
}

async fn name_in_use(conn: &mut SqliteConnection, name: &str, except: Option<i64>) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM clusters WHERE name = ? AND id != ?")
        .bind(name)
        .bind(except.unwrap_or(-1))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to check cluster name", e))?;

    Ok(row.get::<i64, _>("count") > 0)
}

async fn role_taken(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    host_id: i64,
    role: NodeRole,
    except: Option<i64>,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS count FROM nodes
         WHERE cluster_id = ? AND host_id = ? AND role = ? AND id != ?",
    )
    .bind(cluster_id)
    .bind(host_id)
    .bind(role.as_str())
    .bind(except.unwrap_or(-1))
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to check node role", e))?;

    Ok(row.get::<i64, _>("count") > 0)
}

async fn fetch_cluster(conn: &mut SqliteConnection, id: i64) -> Result<Cluster> {
    let row = sqlx::query("SELECT * FROM clusters WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to load cluster", e))?
        .ok_or(Error::ClusterNotFound(id))?;

    row_to_cluster(&row)
}

async fn fetch_node(conn: &mut SqliteConnection, cluster_id: i64, node_id: i64) -> Result<Node> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ? AND cluster_id = ?")
        .bind(node_id)
        .bind(cluster_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to load node", e))?
        .ok_or(Error::NodeNotFound(node_id))?;

    row_to_node(&row)
}

/// Map a unique-constraint violation to the domain conflict, anything else to a db error
fn unique_or(e: sqlx::Error, conflict: impl FnOnce() -> Error, context: &str) -> Error {
    let is_unique = e
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if is_unique {
        conflict()
    } else {
        db_error(context, e)
    }
}

fn row_to_cluster(row: &SqliteRow) -> Result<Cluster> {
    let mode: String = row.get("deployment_mode");
    let status: String = row.get("status");
    let config: String = row.get("config");

    Ok(Cluster {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        deployment_mode: mode.parse()?,
        version: row.get("version"),
        config: serde_json::from_str(&config)
            .map_err(|e| Error::Database(format!("Corrupt cluster config: {}", e)))?,
        status: status.parse()?,
        install_dir: row.get("install_dir"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_node(row: &SqliteRow) -> Result<Node> {
    let role: String = row.get("role");
    let status: String = row.get("status");
    let port = |column: &str| -> Option<u16> {
        row.get::<Option<i64>, _>(column)
            .and_then(|p| u16::try_from(p).ok())
    };

    Ok(Node {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        host_id: row.get("host_id"),
        role: role.parse()?,
        install_dir: row.get("install_dir"),
        membership_port: port("membership_port").unwrap_or_default(),
        api_port: port("api_port"),
        worker_port: port("worker_port"),
        status: status.parse()?,
        process_id: row.get("process_id"),
        last_event_at: row.get("last_event_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
