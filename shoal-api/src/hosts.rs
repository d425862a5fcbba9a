///! Host directory
///!
///! Read-only view of the externally managed host inventory. The core only ever
///! resolves hosts by id; registration and heartbeats arrive from outside.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shoal_common::{HostInfo, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db;

/// Host lookup capability injected into health, precheck and orchestration
#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn get_host(&self, id: i64) -> Result<Option<HostInfo>>;

    /// Resolve several hosts; unknown ids are simply absent from the map
    async fn get_hosts(&self, ids: &[i64]) -> Result<HashMap<i64, HostInfo>> {
        let mut hosts = HashMap::with_capacity(ids.len());
        for &id in ids {
            if hosts.contains_key(&id) {
                continue;
            }
            if let Some(host) = self.get_host(id).await? {
                hosts.insert(id, host);
            }
        }
        Ok(hosts)
    }
}

/// Directory backed by the `hosts` table
pub struct DbHostDirectory {
    pool: SqlitePool,
}

impl DbHostDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, host: &HostInfo) -> Result<()> {
        db::hosts::upsert_host(&self.pool, host).await
    }

    pub async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        db::hosts::record_heartbeat(&self.pool, id, at).await
    }
}

#[async_trait]
impl HostDirectory for DbHostDirectory {
    async fn get_host(&self, id: i64) -> Result<Option<HostInfo>> {
        db::hosts::get_host(&self.pool, id).await
    }
}

/// In-process directory, used by tests and embedded setups
#[derive(Clone, Default)]
pub struct InMemoryHostDirectory {
    hosts: Arc<RwLock<HashMap<i64, HostInfo>>>,
}

impl InMemoryHostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, host: HostInfo) {
        self.hosts.write().await.insert(host.id, host);
    }

    pub async fn remove(&self, id: i64) {
        self.hosts.write().await.remove(&id);
    }

    pub async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(&id)
            .ok_or(shoal_common::Error::HostNotFound(id))?;
        host.last_heartbeat = Some(at);
        Ok(())
    }
}

#[async_trait]
impl HostDirectory for InMemoryHostDirectory {
    async fn get_host(&self, id: i64) -> Result<Option<HostInfo>> {
        Ok(self.hosts.read().await.get(&id).cloned())
    }
}
