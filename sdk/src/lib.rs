//! Single facade over the ingestion pipeline, hybrid search, GraphRAG
//! query engine, and storage recovery operations, for an eventual HTTP/MCP
//! adapter to embed without wiring each crate up itself.

use std::path::Path;
use std::sync::Arc;

use ingestion::processor::{IngestionError, IngestionPipeline};
use ingestion::progress::ProgressTracker;
use ingestion::queue::IndexingQueue;
use ingestion::startup::{StartupManager, StartupReport};
use query::engine::{QueryEngine, QueryError, QueryResponse};
use query::hybrid::{HybridSearchRequest, HybridSearchResponse, HybridSearchError, SearchService};
use query::dsl::QueryRequest;
use ragkb_core::ingest::IngestionRequest;
use storage::recovery::{self, IntegrityChecker, OpStats, OrphanCleaner, RecoveryOperation};
use storage::repo::{RepoError, Repository};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("ingestion failed: {0}")]
    Ingestion(#[from] IngestionError),
    #[error("search failed: {0}")]
    Search(#[from] HybridSearchError),
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
}

/// Owns a `Repository` plus one instance of each higher-level component
/// that operates on it. Construction order mirrors a real deployment: open
/// the store, then hand the same `Arc<Repository>` to every component so
/// they all observe the same WAL/index state.
pub struct KnowledgeBase {
    repo: Arc<Repository>,
    ingestion: IngestionPipeline,
    search: SearchService,
    query_engine: QueryEngine,
    progress: Arc<ProgressTracker>,
    queue: Arc<IndexingQueue>,
}

impl KnowledgeBase {
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, KnowledgeBaseError> {
        let repo = Arc::new(Repository::open(wal_path).await?);
        Ok(Self::from_repo(repo))
    }

    pub fn from_repo(repo: Arc<Repository>) -> Self {
        Self {
            ingestion: IngestionPipeline::new(Arc::clone(&repo)),
            search: SearchService::new(Arc::clone(&repo)),
            query_engine: QueryEngine::new(Arc::clone(&repo)),
            progress: Arc::new(ProgressTracker::new()),
            queue: Arc::new(IndexingQueue::new()),
            repo,
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn ingestion(&self) -> &IngestionPipeline {
        &self.ingestion
    }

    pub fn ingestion_mut(&mut self) -> &mut IngestionPipeline {
        &mut self.ingestion
    }

    pub async fn ingest(&self, request: IngestionRequest) -> Result<Vec<u64>, KnowledgeBaseError> {
        Ok(self.ingestion.ingest(request).await?)
    }

    pub async fn search(
        &self,
        request: HybridSearchRequest,
    ) -> Result<HybridSearchResponse, KnowledgeBaseError> {
        Ok(self.search.search(request).await?)
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, KnowledgeBaseError> {
        Ok(self.query_engine.execute(request).await?)
    }

    /// Runs the self-healing startup sequence (resume in-progress files,
    /// repair orphaned index entries, heal empty documents, queue anything
    /// new found under `watch_root`) against this knowledge base's own
    /// `Repository`, progress tracker and indexing queue.
    pub async fn run_startup_recovery(
        &self,
        watch_root: &Path,
    ) -> Result<StartupReport, KnowledgeBaseError> {
        let manager = StartupManager::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.progress),
            Arc::clone(&self.queue),
        );
        Ok(manager.run(watch_root).await?)
    }

    /// Read-only integrity report, without mutating anything. Prefer this
    /// before `repair_indexes` to decide whether a repair pass is worth
    /// running at all.
    pub async fn check_integrity(&self) -> Result<OpStats, KnowledgeBaseError> {
        let checker = IntegrityChecker::new(Arc::clone(&self.repo));
        Ok(checker.run(true).await?)
    }

    /// Deletes vector/keyword/graph index entries with no corresponding
    /// node, then returns the resulting stats. `exit_code` on the result
    /// mirrors the CLI convention for a recovery command's process exit
    /// status.
    pub async fn repair_indexes(&self) -> Result<OpStats, KnowledgeBaseError> {
        let cleaner = OrphanCleaner::new(Arc::clone(&self.repo));
        Ok(cleaner.run(false).await?)
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn queue(&self) -> &Arc<IndexingQueue> {
        &self.queue
    }
}

pub fn exit_code(stats: &OpStats) -> i32 {
    recovery::exit_code(stats)
}
