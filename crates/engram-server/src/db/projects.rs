// crates/engram-server/src/db/projects.rs
// One pool per project database, opened lazily and cached

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ServiceConfig;

use super::pool::{DatabasePool, DbKind};

/// Registry of per-project database pools.
///
/// Each project gets its own SQLite file under
/// `<data_dir>/projects/<uuid>.db`; pools are opened on first use and
/// kept for the life of the process. An in-memory mode backs tests.
pub struct ProjectDatabases {
    config: ServiceConfig,
    pools: Mutex<HashMap<Uuid, Arc<DatabasePool>>>,
    in_memory: bool,
}

impl ProjectDatabases {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            in_memory: false,
        }
    }

    /// In-memory registry for tests: every project gets a fresh
    /// shared-cache in-memory database.
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            in_memory: true,
        }
    }

    /// Get (or open) the pool for a project.
    pub async fn get(&self, project_id: &Uuid) -> Result<Arc<DatabasePool>> {
        {
            let pools = self.pools.lock().await;
            if let Some(pool) = pools.get(project_id) {
                return Ok(pool.clone());
            }
        }

        let pool = if self.in_memory {
            DatabasePool::open_in_memory(DbKind::Project).await?
        } else {
            let path = self.config.project_db_path(project_id);
            DatabasePool::open(&path, DbKind::Project).await?
        };
        let pool = Arc::new(pool);

        let mut pools = self.pools.lock().await;
        // Another task may have opened the pool while we were; first one wins.
        let entry = pools.entry(*project_id).or_insert_with(|| pool.clone());
        Ok(entry.clone())
    }

    /// Project ids with an open pool (for startup rebuild).
    pub async fn open_projects(&self) -> Vec<Uuid> {
        self.pools.lock().await.keys().copied().collect()
    }

    /// Validate a project UUID string.
    pub fn parse_project_uuid(raw: &str) -> crate::Result<Uuid> {
        Uuid::parse_str(raw)
            .map_err(|e| crate::EngramError::InvalidInput(format!("invalid project UUID '{raw}': {e}")))
    }
}
