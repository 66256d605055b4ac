// crates/engram-server/src/service.rs
// Engram service: wiring and the per-message dispatcher

use std::sync::Arc;

use chrono::{DateTime, Utc};
use engram_types::{
    ContentPlane, FactsQueryPlan, FactsReadCandidate, FactsWriteCandidate, FilesCandidate,
    OrdinalSource, PlanCandidate, RankSpec,
};
use uuid::Uuid;

use crate::canon::{AliasTable, Canonicalizer};
use crate::config::ServiceConfig;
use crate::db::{messages, ProjectDatabases};
use crate::dispatch::{
    DispatchOutcome, FactsReadReply, PlaneReply, SearchReply, FAST_PATH_FACTS,
};
use crate::embeddings::EmbeddingClient;
use crate::facts::normalize::canonical_list_key;
use crate::facts::planner::plan_facts_query;
use crate::facts::store::into_engram_error;
use crate::facts::{apply_facts_ops, execute_facts_plan, FactStore};
use crate::index::{rebuild, SearchFilter, VectorIndex, PROJECT_CHAT_PREFIX};
use crate::indexer::{IndexerContext, IndexingQueue, MessageJob};
use crate::llm::{ChatModel, HttpChatModel, TeacherClient};
use crate::router::Router;
use crate::transcript::TranscriptStore;
use crate::Result;

/// Default result count for index/files searches.
const SEARCH_TOP_K: usize = 10;

/// The assembled memory service.
///
/// Owns the process-wide state (vector index, job queue, alias table
/// handle) and dispatches each incoming message through the router to the
/// correct content plane.
pub struct Engram {
    config: ServiceConfig,
    databases: Arc<ProjectDatabases>,
    canonicalizer: Arc<Canonicalizer>,
    router: Router,
    embedder: Option<Arc<EmbeddingClient>>,
    index: Arc<VectorIndex>,
    queue: Option<IndexingQueue>,
    planner_model: Option<Arc<dyn ChatModel>>,
    transcripts: Option<Arc<dyn TranscriptStore>>,
}

/// Builder for [`Engram`]; tests inject fakes through it.
pub struct EngramBuilder {
    config: ServiceConfig,
    in_memory: bool,
    router_model: Option<Arc<dyn ChatModel>>,
    planner_model: Option<Arc<dyn ChatModel>>,
    teacher_model: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<EmbeddingClient>>,
    transcripts: Option<Arc<dyn TranscriptStore>>,
}

impl EngramBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            in_memory: false,
            router_model: None,
            planner_model: None,
            teacher_model: None,
            embedder: None,
            transcripts: None,
        }
    }

    /// Use in-memory databases (tests).
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn router_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.router_model = Some(model);
        self
    }

    pub fn planner_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.planner_model = Some(model);
        self
    }

    pub fn teacher_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.teacher_model = Some(model);
        self
    }

    pub fn embedder(mut self, embedder: Arc<EmbeddingClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Attach the external transcript store; recent thread history is fed
    /// to the router for context when present.
    pub fn transcript_store(mut self, store: Arc<dyn TranscriptStore>) -> Self {
        self.transcripts = Some(store);
        self
    }

    pub async fn build(self) -> Result<Engram> {
        let databases = Arc::new(if self.in_memory {
            ProjectDatabases::in_memory(self.config.clone())
        } else {
            ProjectDatabases::new(self.config.clone())
        });

        let alias_table = Arc::new(if self.in_memory {
            AliasTable::open_in_memory().await?
        } else {
            AliasTable::open(&self.config.alias_db_path()).await?
        });

        let teacher = self.teacher_model.map(|m| Arc::new(TeacherClient::new(m)));
        let canonicalizer = Arc::new(Canonicalizer::new(
            alias_table,
            self.embedder.clone(),
            teacher,
            self.config.similarity_threshold,
        ));

        let dimension = self
            .embedder
            .as_ref()
            .map(|e| e.dimensions())
            .unwrap_or(self.config.embedding_dim);
        let index = Arc::new(VectorIndex::new(dimension));

        let queue = self.embedder.as_ref().map(|embedder| {
            let ctx = Arc::new(IndexerContext {
                databases: databases.clone(),
                embedder: embedder.clone(),
                index: index.clone(),
            });
            IndexingQueue::start(ctx, self.config.index_workers)
        });

        Ok(Engram {
            router: Router::new(self.router_model),
            config: self.config,
            databases,
            canonicalizer,
            embedder: self.embedder,
            index,
            queue,
            planner_model: self.planner_model,
            transcripts: self.transcripts,
        })
    }
}

impl Engram {
    pub fn builder(config: ServiceConfig) -> EngramBuilder {
        EngramBuilder::new(config)
    }

    /// Assemble from environment configuration, wiring HTTP clients for
    /// every configured endpoint.
    pub async fn from_env() -> Result<Engram> {
        let config = ServiceConfig::from_env();
        let mut builder = EngramBuilder::new(config.clone());

        if let Some(router_url) = &config.endpoints.router {
            let model: Arc<dyn ChatModel> = Arc::new(HttpChatModel::new(
                router_url.clone(),
                config.llm_timeout_secs,
            ));
            builder = builder.router_model(model.clone()).planner_model(model);
        }
        if let Some(teacher_url) = &config.endpoints.teacher {
            builder = builder.teacher_model(Arc::new(HttpChatModel::new(
                teacher_url.clone(),
                config.llm_timeout_secs,
            )));
        }
        if let Some(embedder) = EmbeddingClient::from_config(&config) {
            builder = builder.embedder(Arc::new(embedder));
        }

        builder.build().await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn canonicalizer(&self) -> &Arc<Canonicalizer> {
        &self.canonicalizer
    }

    pub fn queue(&self) -> Option<&IndexingQueue> {
        self.queue.as_ref()
    }

    /// Fact store handle for a project.
    pub async fn fact_store(&self, project_id: &Uuid) -> Result<FactStore> {
        let pool = self.databases.get(project_id).await?;
        Ok(FactStore::new(pool, project_id.to_string()))
    }

    /// Link a file source into a project, enabling its chunks in that
    /// project's searches.
    pub async fn link_source(&self, project_id: &Uuid, source_id: &str) -> Result<()> {
        let pool = self.databases.get(project_id).await?;
        let source = source_id.to_string();
        pool.interact(move |conn| messages::link_source(conn, &source))
            .await
            .map_err(into_engram_error)
    }

    /// Index a file document under a file source in a project.
    pub async fn index_file_document(
        &self,
        project_id: &Uuid,
        source_id: &str,
        file_path: &str,
        text: &str,
    ) -> Result<usize> {
        let Some(embedder) = &self.embedder else {
            return Err(crate::EngramError::IndexUnavailable(
                "no embedding model configured".to_string(),
            ));
        };
        let ctx = IndexerContext {
            databases: self.databases.clone(),
            embedder: embedder.clone(),
            index: self.index.clone(),
        };
        crate::indexer::index_file_document(&ctx, project_id, source_id, file_path, text).await
    }

    /// Rebuild the in-memory index from durable blobs for the given
    /// projects, off the request path.
    pub fn spawn_index_rebuild(&self, project_ids: Vec<Uuid>) -> Option<tokio::task::JoinHandle<()>> {
        let embedder = self.embedder.as_ref()?;
        Some(rebuild::spawn_rebuild(
            self.index.clone(),
            self.databases.clone(),
            project_ids,
            embedder.model_name().to_string(),
        ))
    }

    /// Handle one user message end to end.
    ///
    /// Synchronously upserts the chat message (so `message_uuid` exists
    /// for citations), routes it, executes the chosen plane, and enqueues
    /// chunk/embed indexing so persistence never blocks the reply.
    pub async fn handle_message(
        &self,
        project_id: &Uuid,
        chat_id: &str,
        message_id: &str,
        role: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        message_index: i64,
    ) -> Result<DispatchOutcome> {
        let pool = self.databases.get(project_id).await?;

        // Synchronous pre-step: the UUID must exist before any facts
        // extracted from this message are written.
        let message_uuid = {
            let project = project_id.to_string();
            let chat = chat_id.to_string();
            let message = message_id.to_string();
            let role = role.to_string();
            let content = content.to_string();
            pool.interact_with_retry(move |conn| {
                messages::upsert_chat_message(
                    conn,
                    &project,
                    &chat,
                    &message,
                    &role,
                    &content,
                    timestamp,
                    message_index,
                )
            })
            .await
            .map_err(into_engram_error)?
        };

        // Routing context from the external transcript store, best effort
        let history = match &self.transcripts {
            Some(store) => store
                .load_thread_history("chat", chat_id, project_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!("Transcript history unavailable: {}", e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let plan = self.router.route(content, &history).await;

        let reply = match (&plan.content_plane, &plan.candidate) {
            (ContentPlane::Facts, PlanCandidate::FactsWrite(candidate)) => {
                self.run_facts_write(project_id, &message_uuid, candidate)
                    .await?
            }
            (ContentPlane::Facts, PlanCandidate::FactsRead(candidate)) => {
                self.run_facts_read(project_id, &message_uuid, candidate, plan.source)
                    .await?
            }
            (ContentPlane::Index, PlanCandidate::Index(candidate)) => {
                self.run_search(project_id, &candidate.query, None).await?
            }
            (ContentPlane::Files, PlanCandidate::Files(candidate)) => {
                self.run_files_search(project_id, candidate).await?
            }
            _ => PlaneReply::Chat,
        };

        // Async side: chunk + embed without blocking the response
        let indexing_job_id = match &self.queue {
            Some(queue) if !content.trim().is_empty() => Some(
                queue
                    .enqueue(MessageJob {
                        project_id: *project_id,
                        chat_id: chat_id.to_string(),
                        message_id: message_id.to_string(),
                        message_uuid: message_uuid.clone(),
                        role: role.to_string(),
                        content: content.to_string(),
                        timestamp,
                        message_index,
                    })
                    .await?,
            ),
            _ => None,
        };

        Ok(DispatchOutcome {
            message_uuid,
            plan,
            reply,
            indexing_job_id,
        })
    }

    async fn run_facts_write(
        &self,
        project_id: &Uuid,
        message_uuid: &str,
        candidate: &FactsWriteCandidate,
    ) -> Result<PlaneReply> {
        let canon = self.canonicalizer.canonicalize(&candidate.topic, true).await;
        if canon.confidence == 0.0 {
            // Ambiguity never writes facts
            return Ok(PlaneReply::Clarification(format!(
                "Could not determine a topic from '{}'",
                candidate.topic
            )));
        }

        let list_key = canonical_list_key(&canon.canonical_topic);
        let ops = crate::dispatch::ops_from_write_candidate(candidate, &list_key);

        let pool = self.databases.get(project_id).await?;
        let result = apply_facts_ops(
            &pool,
            &project_id.to_string(),
            message_uuid,
            &ops,
            Some(&self.canonicalizer),
        )
        .await?;
        Ok(PlaneReply::FactsWrite(result))
    }

    async fn run_facts_read(
        &self,
        project_id: &Uuid,
        message_uuid: &str,
        candidate: &FactsReadCandidate,
        route_source: engram_types::RouteSource,
    ) -> Result<PlaneReply> {
        let canon = self.canonicalizer.canonicalize(&candidate.topic, true).await;
        let topic = canon.canonical_topic.clone();
        let list_key = canonical_list_key(&topic);
        let store = self.fact_store(project_id).await?;

        // Base plan. Override-sourced candidates are decisive on their
        // own; the planner model is only an enrichment for model-routed
        // reads, never a correctness dependency.
        let use_planner = route_source != engram_types::RouteSource::Override;
        let (mut plan, mut ordinal_source) = match (&self.planner_model, use_planner) {
            (Some(model), true) => match plan_facts_query(model, &candidate.query).await {
                Ok(planned) => planned,
                Err(e) => {
                    tracing::warn!("Query planner unavailable, using deterministic plan: {}", e);
                    (FactsQueryPlan::ranked_list(topic.clone(), None), OrdinalSource::None)
                }
            },
            _ => (FactsQueryPlan::ranked_list(topic.clone(), None), OrdinalSource::None),
        };

        // The canonical topic always wins over whatever the planner produced
        plan.topic = Some(topic.clone());
        plan.list_key = Some(list_key.clone());

        // The routing candidate's rank always wins over the planner's
        match candidate.rank {
            Some(RankSpec::Nth(rank)) => {
                plan.rank = Some(rank);
                ordinal_source = OrdinalSource::Router;
            }
            Some(RankSpec::Last) => {
                // Dispatcher-side resolution: rewrite to the list's max
                // available rank, then run the ordinary ordinal path.
                let current = store.get_ranked_list(&list_key).await?;
                let max_rank = current.iter().map(|(rank, ..)| *rank).max();
                ordinal_source = OrdinalSource::Router;
                match max_rank {
                    Some(max) => {
                        tracing::info!("Resolved 'last favorite' to rank {} for {}", max, list_key);
                        plan.rank = Some(max);
                    }
                    None => {
                        // Empty list: the empty-valid answer, never a fallback
                        let mut answer = engram_types::FactsAnswer::empty(ordinal_source);
                        answer.rank_applied = true;
                        answer.rank_result_found = Some(false);
                        return Ok(PlaneReply::FactsRead(FactsReadReply {
                            answer,
                            canonical_topic: topic,
                            fast_path: FAST_PATH_FACTS,
                            facts_empty_valid: true,
                            out_of_range: false,
                            resolved_rank: None,
                        }));
                    }
                }
            }
            None => {}
        }

        let answer =
            execute_facts_plan(&store, &plan, Some(message_uuid), ordinal_source).await?;

        let out_of_range = answer.rank_applied
            && answer.rank_result_found == Some(false)
            && answer.max_available_rank.is_some();
        let facts_empty_valid = answer.count == 0 && !out_of_range;

        Ok(PlaneReply::FactsRead(FactsReadReply {
            resolved_rank: plan.rank,
            answer,
            canonical_topic: topic,
            fast_path: FAST_PATH_FACTS,
            facts_empty_valid,
            out_of_range,
        }))
    }

    async fn run_search(
        &self,
        project_id: &Uuid,
        query: &str,
        path_hint: Option<&str>,
    ) -> Result<PlaneReply> {
        let Some(embedder) = &self.embedder else {
            tracing::warn!("Search requested but no embedding model configured");
            return Ok(PlaneReply::Search(SearchReply {
                hits: Vec::new(),
                used_fallback_scan: false,
            }));
        };

        let query_vector = embedder
            .embed_query(query)
            .await
            .map_err(|e| crate::EngramError::Embedding(e.to_string()))?;

        let pool = self.databases.get(project_id).await?;
        let linked = pool
            .interact(messages::linked_sources)
            .await
            .map_err(into_engram_error)?;
        let filter = SearchFilter {
            source_ids: Some(linked.clone()),
            project_id: Some(project_id.to_string()),
            exclude_chat_ids: None,
        };

        // Empty index: brute-force scan of the durable table with the
        // same filtering semantics (cold start is eventually consistent).
        if self.index.is_empty().await {
            let project = project_id.to_string();
            let model_name = embedder.model_name().to_string();
            let scan_query = query_vector.clone();
            let path_hint = path_hint.map(String::from);
            let hits = pool
                .interact(move |conn| {
                    messages::scan_embeddings(
                        conn,
                        &project,
                        &scan_query,
                        SEARCH_TOP_K,
                        Some(linked.as_slice()),
                        Some(project.as_str()),
                        None,
                        &model_name,
                    )
                })
                .await
                .map_err(into_engram_error)?;
            let hits = apply_path_hint(hits, path_hint.as_deref());
            return Ok(PlaneReply::Search(SearchReply {
                hits,
                used_fallback_scan: true,
            }));
        }

        let hits = self.index.search(&query_vector, SEARCH_TOP_K, &filter).await?;
        let hits = apply_path_hint(hits, path_hint);
        Ok(PlaneReply::Search(SearchReply {
            hits,
            used_fallback_scan: false,
        }))
    }

    async fn run_files_search(
        &self,
        project_id: &Uuid,
        candidate: &FilesCandidate,
    ) -> Result<PlaneReply> {
        let reply = self
            .run_search(project_id, &candidate.query, candidate.path_hint.as_deref())
            .await?;
        // The files plane only returns file-source chunks
        Ok(match reply {
            PlaneReply::Search(mut search) => {
                search
                    .hits
                    .retain(|hit| !hit.meta.source_id.starts_with(PROJECT_CHAT_PREFIX));
                PlaneReply::Search(search)
            }
            other => other,
        })
    }
}

/// Restrict hits to a file-path hint, when one was given.
fn apply_path_hint(
    hits: Vec<crate::index::SearchHit>,
    path_hint: Option<&str>,
) -> Vec<crate::index::SearchHit> {
    match path_hint {
        Some(hint) if !hint.trim().is_empty() => hits
            .into_iter()
            .filter(|hit| {
                hit.meta
                    .file_path
                    .as_deref()
                    .map(|p| p.contains(hint))
                    .unwrap_or(true)
            })
            .collect(),
        _ => hits,
    }
}
