// crates/engram-server/src/index/rebuild.rs
// Startup rebuild of the in-memory index from durable embedding blobs

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use crate::db::{messages, ProjectDatabases};

use super::VectorIndex;

/// Rebuild the index for one project from its durable embedding table.
///
/// Returns the number of vectors added. Vectors are normalized at rest,
/// so they load straight into the index.
pub async fn rebuild_project(
    index: &VectorIndex,
    databases: &ProjectDatabases,
    project_id: &Uuid,
    model_name: &str,
) -> Result<usize> {
    let pool = databases.get(project_id).await?;
    let project = project_id.to_string();
    let model = model_name.to_string();
    let rows = pool
        .interact(move |conn| messages::load_all_embeddings(conn, &project, &model))
        .await?;

    if rows.is_empty() {
        return Ok(0);
    }

    let mut vectors = Vec::with_capacity(rows.len());
    let mut metadata = Vec::with_capacity(rows.len());
    for row in rows {
        vectors.push(row.vector);
        metadata.push(row.meta);
    }
    let added = index.add(&vectors, metadata).await?;
    Ok(added)
}

/// Spawn a background rebuild over a set of projects.
///
/// Runs off the request path: serving starts immediately and searches
/// before completion operate on whatever portion is present. Returns the
/// task handle for callers that want to await completion (tests,
/// maintenance commands).
pub fn spawn_rebuild(
    index: Arc<VectorIndex>,
    databases: Arc<ProjectDatabases>,
    project_ids: Vec<Uuid>,
    model_name: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut total = 0;
        for project_id in &project_ids {
            match rebuild_project(&index, &databases, project_id, &model_name).await {
                Ok(added) => total += added,
                Err(e) => {
                    tracing::warn!("Index rebuild failed for project {}: {}", project_id, e);
                }
            }
        }
        tracing::info!(
            "Index rebuild complete: {} vectors across {} projects",
            total,
            project_ids.len()
        );
    })
}
