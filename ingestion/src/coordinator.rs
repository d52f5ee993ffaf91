//! File-system ingestion pipeline: validate -> chunk -> embed -> store.
//!
//! Mirrors `jobs::worker::Worker`'s single-receiver loop shape, split
//! across three stages joined by bounded `mpsc` channels so a slow
//! embedder backs up chunking rather than the whole pipeline stalling on
//! one worker. `Nc` chunk workers feed `Ne` embed workers feed a single
//! store worker, since `Repository::apply_index_transaction` already
//! serializes writes behind its own WAL lock and fanning out writers
//! would just contend on that lock for no gain.

use crate::chunker::{chunker_for_strategy, Chunker};
use crate::embedding::Embedder;
use crate::extract::{
    detect_content_kind, extract_docx_text, extract_epub_text, extract_jupyter_notebook,
    extract_pdf_text, extract_utf8, ContentKind,
};
use crate::policy::ContentPolicy;
use crate::processor::derive_chunk_id;
use crate::progress::ProgressTracker;
use crate::quarantine::QuarantineManager;
use crate::queue::{IndexingQueue, Priority, QueueItem};
use crate::scan_cache::SecurityScanCache;
use crate::validation::{ValidationAction, ValidationChain};
use jobs::queue::{Job, JobQueue};
use ragkb_core::ingest::ChunkingConfig;
use ragkb_core::model::Node;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::obsidian_graph::ObsidianGraphBuilder;
use storage::repo::{RepoError, Repository};
use tokio::sync::mpsc;

/// Tunables for worker-pool width and channel capacity. Defaults mirror
/// `IngestionConfig`'s (`chunk_workers=1`, `embed_workers=2`,
/// `channel_bound=64`).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub chunk_workers: usize,
    pub embed_workers: usize,
    pub channel_bound: usize,
    pub default_model_id: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunk_workers: 1,
            embed_workers: 2,
            channel_bound: 64,
            default_model_id: "embedding-default-v1".to_string(),
        }
    }
}

struct ChunkedUnit {
    file_path: String,
    content_hash: String,
    index: u64,
    content: String,
    metadata: HashMap<String, String>,
}

struct EmbeddedUnit {
    file_path: String,
    chunk_id: u64,
    content: String,
    metadata: HashMap<String, String>,
    embedding: Vec<f32>,
}

/// Owns the queue and workers for one running pipeline. Stages are
/// spawned once via `spawn` and run until their input queue/channel is
/// dropped; `PipelineCoordinator` itself stays cheap to clone-share via
/// `Arc` since the queue is the only mutable shared state workers touch
/// directly.
pub struct PipelineCoordinator {
    pub queue: Arc<IndexingQueue>,
    pub progress: Arc<ProgressTracker>,
    repo: Arc<Repository>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    policy: Arc<dyn ContentPolicy>,
    validation: Arc<ValidationChain>,
    quarantine: Arc<QuarantineManager>,
    scan_cache: Arc<SecurityScanCache>,
    job_queue: Option<Arc<dyn JobQueue>>,
    obsidian: Option<Arc<ObsidianGraphBuilder>>,
    config: CoordinatorConfig,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<Repository>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        policy: Arc<dyn ContentPolicy>,
        validation: Arc<ValidationChain>,
        quarantine: Arc<QuarantineManager>,
        scan_cache: Arc<SecurityScanCache>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            queue: Arc::new(IndexingQueue::new()),
            progress: Arc::new(ProgressTracker::new()),
            repo,
            chunker,
            embedder,
            policy,
            validation,
            quarantine,
            scan_cache,
            job_queue: None,
            obsidian: None,
            config,
        }
    }

    pub fn set_job_queue(&mut self, queue: Arc<dyn JobQueue>) {
        self.job_queue = Some(queue);
    }

    /// Enables note/tag/header graph indexing for markdown files. Without
    /// this, markdown still chunks and embeds normally; only the wikilink
    /// graph is skipped.
    pub fn set_obsidian_graph(&mut self, builder: Arc<ObsidianGraphBuilder>) {
        self.obsidian = Some(builder);
    }

    /// Spawns the chunk/embed/store worker pools and returns their join
    /// handles. Workers run until the coordinator (and every clone of its
    /// queue) is dropped and the channels close, at which point each
    /// stage drains and exits.
    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<ChunkedUnit>(self.config.channel_bound);
        let (embed_tx, embed_rx) = mpsc::channel::<EmbeddedUnit>(self.config.channel_bound);

        let chunk_rx = Arc::new(tokio::sync::Mutex::new(chunk_rx));
        let embed_rx = Arc::new(tokio::sync::Mutex::new(embed_rx));

        let mut handles = Vec::new();

        for _ in 0..self.config.chunk_workers.max(1) {
            let coordinator = Arc::clone(self);
            let tx = chunk_tx.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run_chunk_worker(tx).await;
            }));
        }
        drop(chunk_tx);

        for _ in 0..self.config.embed_workers.max(1) {
            let coordinator = Arc::clone(self);
            let rx = Arc::clone(&chunk_rx);
            let tx = embed_tx.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run_embed_worker(rx, tx).await;
            }));
        }
        drop(embed_tx);

        {
            let coordinator = Arc::clone(self);
            let rx = Arc::clone(&embed_rx);
            handles.push(tokio::spawn(async move {
                coordinator.run_store_worker(rx).await;
            }));
        }

        handles
    }

    /// Pulls paths off the priority queue, validates and chunks each,
    /// and forwards the chunks downstream. A file that fails validation
    /// is quarantined (critical) or tracked-but-skipped (warning) and
    /// never reaches the embed stage.
    async fn run_chunk_worker(&self, tx: mpsc::Sender<ChunkedUnit>) {
        loop {
            let Some(item) = self.queue.get(Duration::from_secs(1)).await else {
                continue;
            };
            self.process_queue_item(item, &tx).await;
        }
    }

    async fn process_queue_item(&self, item: QueueItem, tx: &mpsc::Sender<ChunkedUnit>) {
        let path = item.path.clone();
        let path_str = path.to_string_lossy().to_string();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.progress
                    .record_failed(&path_str, format!("read failed: {err}"));
                self.queue.mark_complete(&path).await;
                return;
            }
        };

        let content_hash = sha256_hex(&bytes);
        self.progress.start(path_str.clone(), content_hash.clone());

        let outcome = match self.scan_cache.get(&content_hash) {
            Some(cached) => cached,
            None => {
                let outcome = self.validation.validate(&path).await;
                self.scan_cache.record(content_hash.clone(), outcome.clone());
                outcome
            }
        };

        match outcome.action() {
            ValidationAction::Quarantine => {
                let reason = outcome
                    .failing()
                    .and_then(|r| r.reason.clone())
                    .unwrap_or_else(|| "validation failed".to_string());
                let check = outcome
                    .failing()
                    .map(|r| r.validation_check.clone())
                    .unwrap_or_default();
                if let Err(err) = self
                    .quarantine
                    .quarantine(&path, reason.clone(), check, content_hash.clone())
                    .await
                {
                    tracing::warn!("failed to quarantine {}: {}", path_str, err);
                }
                self.progress.record_rejected(&path_str, reason);
                self.queue.mark_complete(&path).await;
                return;
            }
            ValidationAction::TrackOnly => {
                let reason = outcome
                    .failing()
                    .and_then(|r| r.reason.clone())
                    .unwrap_or_else(|| "validation warning".to_string());
                self.progress.record_rejected(&path_str, reason);
                self.queue.mark_complete(&path).await;
                return;
            }
            ValidationAction::Allow => {}
        }

        let file_type = outcome.file_type().map(str::to_string);
        let text = match extract_text(&bytes, &path, file_type.as_deref()) {
            Some(text) => text,
            None => {
                self.progress
                    .record_failed(&path_str, "content extraction failed");
                self.queue.mark_complete(&path).await;
                return;
            }
        };

        let text = match self.policy.apply(&text) {
            Ok(text) => text,
            Err(err) => {
                self.progress.record_rejected(&path_str, err.to_string());
                self.queue.mark_complete(&path).await;
                return;
            }
        };

        let mut base_metadata = HashMap::new();
        base_metadata.insert("file_path".to_string(), path_str.clone());
        base_metadata.insert("content_hash".to_string(), content_hash.clone());
        if let Some(file_type) = file_type {
            base_metadata.insert("file_type".to_string(), file_type);
        }
        // Lets `HybridChunker` route source files to the tree-sitter AST
        // chunker; everything else (prose, markdown) falls through to the
        // semantic splitter since `grammar_for_extension` won't match it.
        if let Some(extension) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
        {
            base_metadata.insert("extension".to_string(), extension);
        }

        let chunks = self.chunker.chunk(&text, base_metadata).await;
        self.progress.record_chunked(&path_str, chunks.len());

        if chunks.is_empty() {
            self.progress.record_stored(&path_str, 0);
            self.queue.mark_complete(&path).await;
            return;
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            let unit = ChunkedUnit {
                file_path: path_str.clone(),
                content_hash: content_hash.clone(),
                index: index as u64,
                content: chunk.content,
                metadata: chunk.metadata,
            };
            if tx.send(unit).await.is_err() {
                return;
            }
        }
    }

    async fn run_embed_worker(
        &self,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkedUnit>>>,
        tx: mpsc::Sender<EmbeddedUnit>,
    ) {
        loop {
            let unit = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(unit) = unit else {
                return;
            };

            let embedding = self
                .embedder
                .embed(&unit.content, &self.config.default_model_id)
                .await;
            let chunk_id = derive_chunk_id(&unit.content_hash, unit.index);

            let mut metadata = unit.metadata;
            metadata.insert("kind".to_string(), "chunk".to_string());
            metadata.insert("content_hash".to_string(), unit.content_hash);
            metadata.insert("file_path".to_string(), unit.file_path.clone());

            let embedded = EmbeddedUnit {
                file_path: unit.file_path,
                chunk_id,
                content: unit.content,
                metadata,
                embedding,
            };
            if tx.send(embedded).await.is_err() {
                return;
            }
        }
    }

    async fn run_store_worker(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EmbeddedUnit>>>) {
        let mut stored_per_file: HashMap<String, usize> = HashMap::new();
        let mut chunk_ids_per_file: HashMap<String, Vec<u64>> = HashMap::new();

        loop {
            let unit = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(unit) = unit else {
                return;
            };

            let node = Node {
                id: unit.chunk_id,
                embedding: unit.embedding,
                data: unit.content.clone(),
                metadata: unit.metadata,
            };

            let path = PathBuf::from(&unit.file_path);
            match self.repo.put_node(node).await {
                Ok(()) => {
                    let count = {
                        let entry = stored_per_file.entry(unit.file_path.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let total_chunks = self
                        .progress
                        .get(&unit.file_path)
                        .map(|p| p.total_chunks)
                        .unwrap_or(count);
                    self.enqueue_entity_job(unit.chunk_id, &unit.content).await;
                    chunk_ids_per_file
                        .entry(unit.file_path.clone())
                        .or_default()
                        .push(unit.chunk_id);

                    // Only the chunk that brings the running count up to
                    // `total_chunks` finalizes the document: the queue's
                    // dedup tracking entry for this path must stay held
                    // until every one of its chunks has been stored, or a
                    // concurrent re-add could race an in-flight ingest.
                    if count >= total_chunks {
                        self.progress.record_stored(&unit.file_path, count);
                        stored_per_file.remove(&unit.file_path);
                        let chunk_ids = chunk_ids_per_file.remove(&unit.file_path).unwrap_or_default();
                        self.queue.mark_complete(&path).await;
                        self.index_markdown_graph(&unit.file_path, chunk_ids).await;
                    } else {
                        self.progress.record_chunk_progress(&unit.file_path, count);
                    }
                }
                Err(err) => {
                    self.progress
                        .record_failed(&unit.file_path, store_error_message(&err));
                    stored_per_file.remove(&unit.file_path);
                    chunk_ids_per_file.remove(&unit.file_path);
                    self.queue.mark_complete(&path).await;
                }
            }
        }
    }

    /// Re-reads a finished markdown file and builds its note/tag/header
    /// graph. Runs once per file at store completion rather than per
    /// chunk, since the graph is note-scoped, not chunk-scoped; re-reads
    /// from disk because the chunker only sees post-split text, not the
    /// original markdown wikilinks/headers.
    async fn index_markdown_graph(&self, file_path: &str, chunk_ids: Vec<u64>) {
        let Some(graph) = &self.obsidian else {
            return;
        };
        if !file_path.to_lowercase().ends_with(".md") {
            return;
        }
        let content = match tokio::fs::read_to_string(file_path).await {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("failed to re-read {} for graph indexing: {}", file_path, err);
                return;
            }
        };
        if let Err(err) = graph.index_note(file_path, &content, &chunk_ids).await {
            tracing::warn!("failed to index obsidian graph for {}: {}", file_path, err);
        }
    }

    async fn enqueue_entity_job(&self, node_id: u64, content: &str) {
        let Some(queue) = &self.job_queue else {
            return;
        };
        let snapshot_id = self.repo.current_snapshot_id().await;
        let job = Job::ExtractEntities {
            node_id,
            content: content.to_string(),
            model_id: self.config.default_model_id.clone(),
            snapshot_id,
        };
        if let Err(err) = queue.enqueue(job).await {
            tracing::warn!("failed to enqueue entity extraction job for node {node_id}: {err}");
        }
    }
}

pub fn default_chunker_for(config: ChunkingConfig) -> Box<dyn Chunker> {
    chunker_for_strategy(config)
}

fn store_error_message(err: &RepoError) -> String {
    format!("store failed: {err}")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn extract_text(bytes: &[u8], path: &std::path::Path, file_type: Option<&str>) -> Option<String> {
    match file_type {
        Some("pdf") => extract_pdf_text(bytes),
        Some("docx") => extract_docx_text(bytes),
        Some("epub") => extract_epub_text(bytes),
        _ => {
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            match detect_content_kind("application/octet-stream", Some(filename)) {
                ContentKind::Jupyter => {
                    extract_jupyter_notebook(bytes).map(|nb| nb.merged_text())
                }
                _ => extract_utf8(bytes).ok(),
            }
        }
    }
}

/// Enqueues a single path at `priority`, for callers (watcher, startup
/// self-healer) that don't need the rest of the coordinator's state.
pub async fn enqueue_path(queue: &IndexingQueue, path: impl Into<PathBuf>, priority: Priority) {
    queue.add(path, priority, false).await;
}
