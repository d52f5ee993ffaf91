use crate::chunker::{chunker_for_strategy, Chunker, HybridChunker};
use crate::embedding::{DeterministicEmbedder, Embedder};
use crate::extract::{
    detect_content_kind, extract_docx_text, extract_epub_text, extract_jupyter_notebook,
    extract_pdf_text, extract_utf8, ContentKind,
};
use crate::policy::{ContentPolicy, NoOpPolicy, PolicyError};
use dashmap::DashMap;
use ragkb_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use ragkb_core::auth::{Action, Authorizer, AuthzError, Principal, ResourceContext};
use ragkb_core::governance::{GovernanceError, GovernancePolicyStore};
use ragkb_core::ingest::{ChunkingConfig, ContentHash, IngestionRequest};
use ragkb_core::model::Node;
use jobs::queue::{Job, JobQueue};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use storage::repo::Repository;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::repo::RepoError),
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("Invalid UTF-8 content")]
    InvalidUtf8,
    #[error("Content extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("authorization denied: {0}")]
    Unauthorized(#[from] AuthzError),
    #[error("governance policy violation: {0}")]
    Governance(#[from] GovernanceError),
}

pub struct IngestionPipeline {
    repo: Arc<Repository>,
    chunker: Box<dyn Chunker>,
    embedder: Box<dyn Embedder>,
    policy: Box<dyn ContentPolicy>,
    default_model_id: String,
    /// Per-key async locks so concurrent ingestion of the same idempotency
    /// key (or content hash, absent a key) serializes instead of racing two
    /// writers through the chunk/embed/store pipeline.
    locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    governance_store: Option<Arc<dyn GovernancePolicyStore>>,
    job_queue: Option<Arc<dyn JobQueue>>,
}

impl IngestionPipeline {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            chunker: Box::new(HybridChunker::default()),
            embedder: Box::new(DeterministicEmbedder::default()),
            policy: Box::new(NoOpPolicy),
            default_model_id: "embedding-default-v1".to_string(),
            locks: Arc::new(DashMap::new()),
            audit_sink: None,
            governance_store: None,
            job_queue: None,
        }
    }

    pub fn with_chunker(repo: Arc<Repository>, chunker: Box<dyn Chunker>) -> Self {
        Self {
            repo,
            chunker,
            embedder: Box::new(DeterministicEmbedder::default()),
            policy: Box::new(NoOpPolicy),
            default_model_id: "embedding-default-v1".to_string(),
            locks: Arc::new(DashMap::new()),
            audit_sink: None,
            governance_store: None,
            job_queue: None,
        }
    }

    pub fn with_components(
        repo: Arc<Repository>,
        chunker: Box<dyn Chunker>,
        embedder: Box<dyn Embedder>,
        policy: Box<dyn ContentPolicy>,
        default_model_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            chunker,
            embedder,
            policy,
            default_model_id: default_model_id.into(),
            locks: Arc::new(DashMap::new()),
            audit_sink: None,
            governance_store: None,
            job_queue: None,
        }
    }

    pub fn set_audit_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.audit_sink = Some(sink);
    }

    pub fn set_governance_policy_store(&mut self, store: Arc<dyn GovernancePolicyStore>) {
        self.governance_store = Some(store);
    }

    pub fn set_job_queue(&mut self, queue: Arc<dyn JobQueue>) {
        self.job_queue = Some(queue);
    }

    pub async fn ingest(&self, request: IngestionRequest) -> Result<Vec<u64>, IngestionError> {
        let model_id = request
            .model_id()
            .unwrap_or(&self.default_model_id)
            .to_string();

        let outcome = self.ingest_core(request, HashMap::new()).await;
        self.audit_outcome(&outcome, None, None, Some(model_id)).await;
        outcome
    }

    /// Authorizes `principal` for the ingest action against `resource`, then
    /// (if a governance store is configured for the principal's tenant)
    /// enforces data-residency and stamps retention/KMS metadata before
    /// running the ordinary ingest pipeline.
    pub async fn ingest_authorized(
        &self,
        request: IngestionRequest,
        principal: &Principal,
        authorizer: &Authorizer,
        resource: &ResourceContext,
    ) -> Result<Vec<u64>, IngestionError> {
        if let Err(err) = authorizer.authorize(principal, Action::Ingest, resource) {
            self.record_audit_event(
                AuditOutcome::Denied,
                Some(principal.subject.clone()),
                Some(principal.tenant.clone()),
                None,
                None,
                Some(err.to_string()),
            );
            return Err(IngestionError::Unauthorized(err));
        }

        let model_id = request
            .model_id()
            .unwrap_or(&self.default_model_id)
            .to_string();

        let mut extra_metadata = HashMap::new();
        if let Some(store) = &self.governance_store {
            match store.get_policy(&principal.tenant) {
                Ok(Some(policy)) => {
                    let region = request.metadata().get("region").map(String::as_str);
                    if let Err(err) = policy.ensure_residency(region) {
                        self.record_audit_event(
                            AuditOutcome::Failed,
                            Some(principal.subject.clone()),
                            Some(principal.tenant.clone()),
                            Some(model_id),
                            None,
                            Some(err.to_string()),
                        );
                        return Err(IngestionError::Governance(err));
                    }

                    let now_unix = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    extra_metadata.insert("tenant".to_string(), policy.tenant.clone());
                    extra_metadata.insert(
                        "residency_region".to_string(),
                        policy.residency_region.clone(),
                    );
                    extra_metadata.insert(
                        "retention_until_unix".to_string(),
                        policy.retention_deadline_unix(now_unix).to_string(),
                    );
                    if let Some(kms_key_id) = policy.kms_key_id() {
                        extra_metadata.insert("kms_key_id".to_string(), kms_key_id.to_string());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.record_audit_event(
                        AuditOutcome::Failed,
                        Some(principal.subject.clone()),
                        Some(principal.tenant.clone()),
                        Some(model_id),
                        None,
                        Some(err.to_string()),
                    );
                    return Err(IngestionError::Governance(err));
                }
            }
        }

        let outcome = self.ingest_core(request, extra_metadata).await;
        self.audit_outcome(
            &outcome,
            Some(principal.subject.clone()),
            Some(principal.tenant.clone()),
            Some(model_id),
        )
        .await;
        outcome
    }

    async fn audit_outcome(
        &self,
        outcome: &Result<Vec<u64>, IngestionError>,
        actor: Option<String>,
        tenant: Option<String>,
        model_id: Option<String>,
    ) {
        if self.audit_sink.is_none() {
            return;
        }
        let snapshot_id = self.repo.current_snapshot_id().await;
        match outcome {
            Ok(_) => self.record_audit_event(
                AuditOutcome::Succeeded,
                actor,
                tenant,
                model_id,
                Some(snapshot_id),
                None,
            ),
            Err(err) => self.record_audit_event(
                AuditOutcome::Failed,
                actor,
                tenant,
                model_id,
                Some(snapshot_id),
                Some(err.to_string()),
            ),
        }
    }

    fn record_audit_event(
        &self,
        outcome: AuditOutcome,
        actor: Option<String>,
        tenant: Option<String>,
        model_id: Option<String>,
        snapshot_id: Option<String>,
        error: Option<String>,
    ) {
        let Some(sink) = &self.audit_sink else {
            return;
        };

        let mut event = AuditEvent::new(AuditOperation::Ingest, outcome);
        event.actor = actor;
        event.tenant = tenant;
        event.model_id = model_id;
        event.snapshot_id = snapshot_id;
        if let Some(error) = error {
            event.metadata.insert("error".to_string(), error);
        }

        if let Err(err) = sink.record(event) {
            tracing::warn!("failed to record ingestion audit event: {}", err);
        }
    }

    async fn ingest_core(
        &self,
        request: IngestionRequest,
        extra_metadata: HashMap<String, String>,
    ) -> Result<Vec<u64>, IngestionError> {
        let content_hash = request.content_hash();
        let idempotency_key = request.idempotency_key().map(|key| key.to_string());
        let lock_key = idempotency_key.clone().unwrap_or_else(|| content_hash.clone());

        let key_lock = self
            .locks
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = key_lock.lock().await;

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(ids) = self.repo.check_idempotency(key).await {
                self.locks.remove(&lock_key);
                return Ok(ids);
            }
        }
        if let Some(ids) = self.repo.check_idempotency(&content_hash).await {
            self.locks.remove(&lock_key);
            return Ok(ids);
        }

        let model_id = request
            .model_id()
            .unwrap_or(&self.default_model_id)
            .to_string();

        let (text, mut metadata) = extract_request_text(request)?;
        metadata.insert("content_hash".to_string(), content_hash.clone());
        metadata.insert("model_id".to_string(), model_id.clone());
        if let Some(key) = &idempotency_key {
            metadata.insert("idempotency_key".to_string(), key.clone());
        }
        for (key, value) in &extra_metadata {
            metadata.insert(key.clone(), value.clone());
        }

        let text = self.policy.apply(&text)?;
        let chunks = self.chunker.chunk(&text, metadata).await;

        let mut node_ids = Vec::new();
        let mut queued_jobs = Vec::new();
        for (i, mut chunk) in chunks.into_iter().enumerate() {
            let embedding = self.embedder.embed(&chunk.content, &model_id).await;
            chunk.embedding = Some(embedding.clone());
            chunk
                .metadata
                .insert("kind".to_string(), "chunk".to_string());

            let chunk_id = derive_chunk_id(&content_hash, i as u64);

            let node = Node {
                id: chunk_id,
                embedding,
                data: chunk.content.clone(),
                metadata: chunk.metadata,
            };

            self.repo.put_node(node).await?;
            node_ids.push(chunk_id);
            queued_jobs.push((chunk_id, chunk.content));
        }

        if let Some(key) = &idempotency_key {
            self.repo.record_idempotency(key, node_ids.clone()).await?;
        }
        self.repo
            .record_idempotency(&content_hash, node_ids.clone())
            .await?;

        if let Some(queue) = &self.job_queue {
            let snapshot_id = self.repo.current_snapshot_id().await;
            for (node_id, content) in queued_jobs {
                let job = Job::ExtractEntities {
                    node_id,
                    content,
                    model_id: model_id.clone(),
                    snapshot_id: snapshot_id.clone(),
                };
                if let Err(err) = queue.enqueue(job).await {
                    tracing::warn!(
                        "failed to enqueue entity extraction job for node {}: {}",
                        node_id,
                        err
                    );
                }
            }
        }

        self.locks.remove(&lock_key);
        Ok(node_ids)
    }
}

pub(crate) fn derive_chunk_id(content_hash: &str, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

fn extract_request_text(
    request: IngestionRequest,
) -> Result<(String, HashMap<String, String>), IngestionError> {
    match request {
        IngestionRequest::Text {
            content, metadata, ..
        } => Ok((content, metadata)),
        IngestionRequest::File {
            filename,
            content,
            mime_type,
            mut metadata,
            ..
        } => {
            let kind = detect_content_kind(&mime_type, Some(&filename));
            if let Some(extension) = Path::new(&filename)
                .extension()
                .and_then(|e| e.to_str())
            {
                metadata
                    .entry("extension".to_string())
                    .or_insert_with(|| extension.to_lowercase());
            }
            metadata.insert("filename".to_string(), filename);
            metadata.insert("mime_type".to_string(), mime_type.clone());

            match kind {
                ContentKind::Text | ContentKind::Markdown | ContentKind::Json => {
                    let text = extract_utf8(&content).map_err(|_| IngestionError::InvalidUtf8)?;
                    Ok((text, metadata))
                }
                ContentKind::Pdf => extract_pdf_text(&content)
                    .map(|text| (text, metadata))
                    .ok_or_else(|| IngestionError::ExtractionFailed("pdf".to_string())),
                ContentKind::Docx => extract_docx_text(&content)
                    .map(|text| (text, metadata))
                    .ok_or_else(|| IngestionError::ExtractionFailed("docx".to_string())),
                ContentKind::Epub => extract_epub_text(&content)
                    .map(|text| (text, metadata))
                    .ok_or_else(|| IngestionError::ExtractionFailed("epub".to_string())),
                ContentKind::Jupyter => {
                    let notebook = extract_jupyter_notebook(&content)
                        .ok_or_else(|| IngestionError::ExtractionFailed("jupyter".to_string()))?;
                    if let Some(language) = &notebook.kernel_language {
                        metadata
                            .entry("language".to_string())
                            .or_insert_with(|| language.clone());
                    }
                    Ok((notebook.merged_text(), metadata))
                }
                ContentKind::Unsupported => Err(IngestionError::UnsupportedType(mime_type)),
            }
        }
    }
}

#[allow(dead_code)]
pub fn default_chunker() -> Box<dyn Chunker> {
    chunker_for_strategy(ChunkingConfig::default())
}
