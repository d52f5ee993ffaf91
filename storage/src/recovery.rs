//! Offline/online repair passes over a `Repository`'s indexes.
//!
//! Every operation implements the shared `RecoveryOperation` trait so a
//! CLI or admin surface can drive them uniformly: run with `dry_run:
//! true` to report what's wrong without touching anything, or `false` to
//! also fix it. Grounded in the same "detect then optionally mutate"
//! shape `OrphanCleaner` and `HnswRebuilder` both follow below — neither
//! the checker nor the rebuilders ever take a lock longer than the pass
//! itself needs.

use crate::index::AdjacencyGraph;
use crate::repo::{RepoError, Repository};
use async_trait::async_trait;
use ragkb_core::model::Node;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct OpStats {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub checks: usize,
    pub table_counts: HashMap<String, usize>,
    pub repaired: usize,
}

impl OpStats {
    fn clean(checks: usize) -> Self {
        Self {
            healthy: true,
            issues: Vec::new(),
            checks,
            table_counts: HashMap::new(),
            repaired: 0,
        }
    }
}

/// `0` when the repository needed no repair, `1` when issues were found
/// and not fixed (dry run, or a check-only pass), `0` when issues were
/// found and fully repaired. Mirrors the convention shell tooling expects
/// from a `fsck`-style command.
pub fn exit_code(stats: &OpStats) -> i32 {
    if stats.healthy || (!stats.issues.is_empty() && stats.repaired >= stats.issues.len()) {
        0
    } else {
        1
    }
}

#[async_trait]
pub trait RecoveryOperation: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError>;
}

fn is_chunk(node: &Node) -> bool {
    node.metadata.get("kind").map(String::as_str) == Some("chunk")
}

/// Compares the node store against each index's membership and reports
/// mismatches. Never mutates anything regardless of `dry_run` — this is
/// the read-only diagnostic the other operations build on.
pub struct IntegrityChecker {
    repo: Arc<Repository>,
}

impl IntegrityChecker {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RecoveryOperation for IntegrityChecker {
    fn name(&self) -> &'static str {
        "integrity_check"
    }

    async fn run(&self, _dry_run: bool) -> Result<OpStats, RepoError> {
        let ids = self.repo.list_node_ids().await;
        let node_ids: HashSet<u64> = ids.iter().copied().collect();
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let chunk_ids: HashSet<u64> = nodes.iter().filter(|n| is_chunk(n)).map(|n| n.id).collect();

        let index = self.repo.hyper_index.read().await;
        let vector_ids: HashSet<u64> = index.vector_index.all_ids().into_iter().collect();
        let fts_ids: HashSet<u64> = index.fts_index.all_chunk_ids().unwrap_or_default().into_iter().collect();
        let graph_ids: HashSet<u64> = index.graph_index.node_ids().into_iter().collect();
        drop(index);

        let mut stats = OpStats::clean(4);
        stats.table_counts.insert("nodes".to_string(), node_ids.len());
        stats.table_counts.insert("vector_index".to_string(), vector_ids.len());
        stats.table_counts.insert("fts_index".to_string(), fts_ids.len());
        stats.table_counts.insert("graph_index".to_string(), graph_ids.len());

        let orphan_vectors: Vec<&u64> = vector_ids.difference(&node_ids).collect();
        if !orphan_vectors.is_empty() {
            stats.healthy = false;
            stats.issues.push(format!(
                "{} vector entries with no backing node",
                orphan_vectors.len()
            ));
        }

        let orphan_fts: Vec<&u64> = fts_ids.difference(&chunk_ids).collect();
        if !orphan_fts.is_empty() {
            stats.healthy = false;
            stats.issues.push(format!(
                "{} fts postings with no backing chunk node",
                orphan_fts.len()
            ));
        }

        let orphan_graph: Vec<&u64> = graph_ids.difference(&node_ids).collect();
        if !orphan_graph.is_empty() {
            stats.healthy = false;
            stats.issues.push(format!(
                "{} graph nodes with no backing node",
                orphan_graph.len()
            ));
        }

        let missing_vectors = chunk_ids
            .iter()
            .filter(|id| !vector_ids.contains(id))
            .count();
        if missing_vectors > 0 {
            stats.healthy = false;
            stats.issues.push(format!(
                "{missing_vectors} chunk nodes missing a vector-index entry"
            ));
        }

        Ok(stats)
    }
}

/// Removes index entries (vector, keyword, graph) that point at node ids
/// no longer present in the repository.
pub struct OrphanCleaner {
    repo: Arc<Repository>,
}

impl OrphanCleaner {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RecoveryOperation for OrphanCleaner {
    fn name(&self) -> &'static str {
        "orphan_cleanup"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let node_ids: HashSet<u64> = self.repo.list_node_ids().await.into_iter().collect();

        let mut index = self.repo.hyper_index.write().await;

        let orphan_vectors: Vec<u64> = index
            .vector_index
            .all_ids()
            .into_iter()
            .filter(|id| !node_ids.contains(id))
            .collect();
        let orphan_fts: Vec<u64> = index
            .fts_index
            .all_chunk_ids()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !node_ids.contains(id))
            .collect();
        let orphan_graph: Vec<u64> = index
            .graph_index
            .node_ids()
            .into_iter()
            .filter(|id| !node_ids.contains(id))
            .collect();

        let mut stats = OpStats::clean(3);
        stats.table_counts.insert("orphan_vectors".to_string(), orphan_vectors.len());
        stats.table_counts.insert("orphan_fts".to_string(), orphan_fts.len());
        stats.table_counts.insert("orphan_graph".to_string(), orphan_graph.len());

        let total = orphan_vectors.len() + orphan_fts.len() + orphan_graph.len();
        if total == 0 {
            return Ok(stats);
        }

        stats.healthy = false;
        stats.issues.push(format!("{total} orphaned index entries found"));

        if dry_run {
            return Ok(stats);
        }

        for id in &orphan_vectors {
            if index.vector_index.delete(*id) {
                stats.repaired += 1;
            }
        }
        for id in &orphan_fts {
            index.remove_content(*id);
            stats.repaired += 1;
        }
        for id in &orphan_graph {
            index.graph_index.remove_node(*id);
            stats.repaired += 1;
        }

        Ok(stats)
    }
}

/// Discards and rebuilds the vector index from the node store's current
/// embeddings, fixing a vector index left inconsistent by a crash
/// mid-write (stale or duplicate entries `OrphanCleaner` alone wouldn't
/// catch, since they're not orphaned, just wrong).
pub struct HnswRebuilder {
    repo: Arc<Repository>,
}

impl HnswRebuilder {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RecoveryOperation for HnswRebuilder {
    fn name(&self) -> &'static str {
        "hnsw_rebuild"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let embedded: Vec<&Node> = nodes.iter().filter(|n| !n.embedding.is_empty()).collect();

        let mut stats = OpStats::clean(1);
        stats.table_counts.insert("embedded_nodes".to_string(), embedded.len());

        if dry_run {
            return Ok(stats);
        }

        let mut index = self.repo.hyper_index.write().await;
        index.vector_index = crate::index::HnswIndex::new();
        for node in &embedded {
            index.vector_index.insert(node.id, node.embedding.clone());
        }
        stats.repaired = embedded.len();

        Ok(stats)
    }
}

/// Discards and rebuilds the keyword index from the node store's
/// chunk-kind content.
pub struct FtsRebuilder {
    repo: Arc<Repository>,
}

impl FtsRebuilder {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RecoveryOperation for FtsRebuilder {
    fn name(&self) -> &'static str {
        "fts_rebuild"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let chunks: Vec<&Node> = nodes.iter().filter(|n| is_chunk(n)).collect();

        let mut stats = OpStats::clean(1);
        stats.table_counts.insert("chunk_nodes".to_string(), chunks.len());

        if dry_run {
            return Ok(stats);
        }

        let index = self.repo.hyper_index.read().await;
        index.fts_index.clear().map_err(|_| RepoError::Serialization)?;
        for node in &chunks {
            let _ = index.fts_index.upsert(node.id, &node.data);
        }
        stats.repaired = chunks.len();

        Ok(stats)
    }
}

/// Flags chunk nodes whose embedding is empty or whose dimension doesn't
/// match the repository's dominant embedding dimension, then re-encodes
/// every chunk node with `ragkb_core::embedding::deterministic_embedding`
/// (the same in-process embedder `DeterministicEmbedder` wraps) and
/// truncates and rebuilds the vector index from the result, so a full
/// rebuild is a self-contained repair rather than a deferral to the
/// ingestion pipeline.
pub struct EmbeddingRebuilder {
    repo: Arc<Repository>,
}

const DEFAULT_EMBEDDING_MODEL_ID: &str = "embedding-default-v1";
const DEFAULT_EMBEDDING_DIMS: usize = 768;

impl EmbeddingRebuilder {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// File paths (from node metadata) that need re-embedding, for a
    /// caller that wants the list rather than just a count.
    pub async fn affected_paths(&self) -> Vec<String> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let expected_dim = self.repo.embedding_dimension().await;

        nodes
            .into_iter()
            .filter(|n| is_chunk(n))
            .filter(|n| match expected_dim {
                Some(dim) => n.embedding.is_empty() || n.embedding.len() != dim,
                None => n.embedding.is_empty(),
            })
            .filter_map(|n| n.metadata.get("file_path").cloned())
            .collect()
    }
}

#[async_trait]
impl RecoveryOperation for EmbeddingRebuilder {
    fn name(&self) -> &'static str {
        "embedding_rebuild"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let chunks: Vec<Node> = nodes.into_iter().filter(is_chunk).collect();
        let dims = self
            .repo
            .embedding_dimension()
            .await
            .unwrap_or(DEFAULT_EMBEDDING_DIMS);

        let mut stats = OpStats::clean(1);
        stats.table_counts.insert("chunk_nodes".to_string(), chunks.len());

        if dry_run {
            return Ok(stats);
        }

        // Truncate first: a full rebuild discards whatever the vector
        // index currently holds rather than patching around it.
        {
            let mut index = self.repo.hyper_index.write().await;
            index.vector_index = crate::index::HnswIndex::new();
        }

        for mut node in chunks {
            let model_id = node
                .metadata
                .get("model_id")
                .cloned()
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL_ID.to_string());
            node.embedding =
                ragkb_core::embedding::deterministic_embedding(&node.data, &model_id, dims);
            self.repo.put_node(node).await?;
            stats.repaired += 1;
        }

        Ok(stats)
    }
}

/// Re-syncs a targeted subset of node ids into the vector and keyword
/// indexes, for repairing a partial write (e.g. the store stage crashed
/// after writing some but not all chunks of a file) without paying for a
/// full rebuild.
pub struct PartialRebuilder {
    repo: Arc<Repository>,
    ids: Vec<u64>,
}

impl PartialRebuilder {
    pub fn new(repo: Arc<Repository>, ids: Vec<u64>) -> Self {
        Self { repo, ids }
    }
}

#[async_trait]
impl RecoveryOperation for PartialRebuilder {
    fn name(&self) -> &'static str {
        "partial_rebuild"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let nodes = self.repo.get_nodes_by_ids(&self.ids).await;
        let mut stats = OpStats::clean(1);
        stats.table_counts.insert("requested".to_string(), self.ids.len());
        stats.table_counts.insert("found".to_string(), nodes.len());

        if nodes.len() < self.ids.len() {
            stats.healthy = false;
            stats.issues.push(format!(
                "{} requested ids have no backing node",
                self.ids.len() - nodes.len()
            ));
        }

        if dry_run {
            return Ok(stats);
        }

        let mut index = self.repo.hyper_index.write().await;
        for node in &nodes {
            if !node.embedding.is_empty() {
                index.vector_index.insert(node.id, node.embedding.clone());
            }
            if is_chunk(node) {
                index.index_content(node.id, &node.data);
            }
            stats.repaired += 1;
        }

        Ok(stats)
    }
}

/// Runs `IntegrityChecker` and, if unhealthy, chains `OrphanCleaner`,
/// `HnswRebuilder` and `FtsRebuilder` in sequence. The one-stop "fix
/// whatever's wrong" entry point for an operator who doesn't want to
/// pick a specific rebuilder.
pub struct IndexRepairer {
    repo: Arc<Repository>,
}

impl IndexRepairer {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RecoveryOperation for IndexRepairer {
    fn name(&self) -> &'static str {
        "index_repair"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let checker = IntegrityChecker::new(Arc::clone(&self.repo));
        let check = checker.run(true).await?;

        if check.healthy {
            return Ok(check);
        }

        let mut combined = OpStats::clean(check.checks);
        combined.table_counts = check.table_counts.clone();
        combined.issues = check.issues.clone();
        combined.healthy = false;

        if dry_run {
            return Ok(combined);
        }

        let orphan = OrphanCleaner::new(Arc::clone(&self.repo)).run(false).await?;
        let hnsw = HnswRebuilder::new(Arc::clone(&self.repo)).run(false).await?;
        let fts = FtsRebuilder::new(Arc::clone(&self.repo)).run(false).await?;

        combined.repaired = orphan.repaired + hnsw.repaired + fts.repaired;

        let recheck = IntegrityChecker::new(Arc::clone(&self.repo)).run(true).await?;
        combined.healthy = recheck.healthy;
        combined.issues = recheck.issues;

        Ok(combined)
    }
}

/// Deletes every node whose `file_path` metadata matches one of `paths`,
/// for an operator command ("reindex this file from scratch") that needs
/// stale chunks gone before re-ingestion runs.
pub struct PathReindexer {
    repo: Arc<Repository>,
    paths: HashSet<String>,
}

impl PathReindexer {
    pub fn new(repo: Arc<Repository>, paths: Vec<String>) -> Self {
        Self {
            repo,
            paths: paths.into_iter().collect(),
        }
    }
}

#[async_trait]
impl RecoveryOperation for PathReindexer {
    fn name(&self) -> &'static str {
        "path_reindex"
    }

    async fn run(&self, dry_run: bool) -> Result<OpStats, RepoError> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let matching: Vec<&Node> = nodes
            .iter()
            .filter(|n| {
                n.metadata
                    .get("file_path")
                    .map(|p| self.paths.contains(p))
                    .unwrap_or(false)
            })
            .collect();

        let mut stats = OpStats::clean(1);
        stats.table_counts.insert("matching_nodes".to_string(), matching.len());
        if matching.is_empty() {
            return Ok(stats);
        }

        stats.healthy = false;
        stats.issues.push(format!("{} nodes queued for reindex deletion", matching.len()));

        if dry_run {
            return Ok(stats);
        }

        for node in &matching {
            self.repo.delete_node(node.id).await?;
            stats.repaired += 1;
        }
        stats.healthy = true;

        Ok(stats)
    }
}

/// Used by `IntegrityChecker`/tests that want a plain graph snapshot
/// without going through `Repository::graph_index`.
#[allow(dead_code)]
fn graph_node_ids(graph: &AdjacencyGraph) -> Vec<u64> {
    graph.node_ids()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragkb_core::model::Node;
    use tempfile::tempdir;

    async fn test_repo(dir: &std::path::Path) -> Arc<Repository> {
        Arc::new(Repository::open(dir.join("wal.log")).await.unwrap())
    }

    fn chunk_node(id: u64, file_path: &str, content: &str) -> Node {
        let mut node = Node::new(id, vec![1.0, 0.0], content.to_string());
        node.metadata.insert("kind".to_string(), "chunk".to_string());
        node.metadata.insert("file_path".to_string(), file_path.to_string());
        node
    }

    #[tokio::test]
    async fn integrity_checker_reports_healthy_on_consistent_store() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello world")).await.unwrap();

        let checker = IntegrityChecker::new(repo);
        let stats = checker.run(true).await.unwrap();
        assert!(stats.healthy);
        assert!(stats.issues.is_empty());
    }

    #[tokio::test]
    async fn orphan_cleaner_removes_vector_entry_with_no_node() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello world")).await.unwrap();

        {
            let mut index = repo.hyper_index.write().await;
            index.vector_index.insert(999, vec![0.0, 1.0]);
        }

        let cleaner = OrphanCleaner::new(Arc::clone(&repo));
        let stats = cleaner.run(false).await.unwrap();
        assert_eq!(stats.repaired, 1);

        let index = repo.hyper_index.read().await;
        assert!(!index.vector_index.all_ids().contains(&999));
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello")).await.unwrap();
        {
            let mut index = repo.hyper_index.write().await;
            index.vector_index.insert(999, vec![0.0, 1.0]);
        }

        let cleaner = OrphanCleaner::new(Arc::clone(&repo));
        let stats = cleaner.run(true).await.unwrap();
        assert_eq!(stats.repaired, 0);
        assert!(!stats.healthy);

        let index = repo.hyper_index.read().await;
        assert!(index.vector_index.all_ids().contains(&999));
    }

    #[tokio::test]
    async fn hnsw_rebuilder_reinserts_from_node_embeddings() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello")).await.unwrap();

        let rebuilder = HnswRebuilder::new(Arc::clone(&repo));
        let stats = rebuilder.run(false).await.unwrap();
        assert_eq!(stats.repaired, 1);

        let index = repo.hyper_index.read().await;
        assert!(index.vector_index.all_ids().contains(&1));
    }

    #[tokio::test]
    async fn path_reindexer_deletes_matching_nodes_only() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello")).await.unwrap();
        repo.put_node(chunk_node(2, "b.md", "world")).await.unwrap();

        let reindexer = PathReindexer::new(Arc::clone(&repo), vec!["a.md".to_string()]);
        let stats = reindexer.run(false).await.unwrap();
        assert_eq!(stats.repaired, 1);

        let ids = repo.list_node_ids().await;
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn embedding_rebuilder_restores_integrity_for_unembedded_chunks() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;

        // A chunk with no embedding, as if the store stage crashed before
        // the vector insert landed.
        let mut node = Node::new(1, Vec::new(), "hello world".to_string());
        node.metadata.insert("kind".to_string(), "chunk".to_string());
        node.metadata.insert("model_id".to_string(), "embedding-default-v1".to_string());
        repo.put_node(node).await.unwrap();

        let before = IntegrityChecker::new(Arc::clone(&repo)).run(true).await.unwrap();
        assert!(!before.healthy);

        let rebuilder = EmbeddingRebuilder::new(Arc::clone(&repo));
        let stats = rebuilder.run(false).await.unwrap();
        assert_eq!(stats.repaired, 1);

        let after = IntegrityChecker::new(Arc::clone(&repo)).run(true).await.unwrap();
        assert!(after.healthy, "issues: {:?}", after.issues);

        let refreshed = repo.get_node(1).await.unwrap();
        assert!(!refreshed.embedding.is_empty());
    }

    #[tokio::test]
    async fn embedding_rebuilder_is_noop_under_dry_run() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        repo.put_node(chunk_node(1, "a.md", "hello")).await.unwrap();

        let rebuilder = EmbeddingRebuilder::new(Arc::clone(&repo));
        let stats = rebuilder.run(true).await.unwrap();
        assert_eq!(stats.repaired, 0);
    }

    #[test]
    fn exit_code_is_zero_for_healthy_stats() {
        let stats = OpStats::clean(1);
        assert_eq!(exit_code(&stats), 0);
    }

    #[test]
    fn exit_code_is_nonzero_for_unrepaired_issues() {
        let mut stats = OpStats::clean(1);
        stats.healthy = false;
        stats.issues.push("something wrong".to_string());
        assert_eq!(exit_code(&stats), 1);
    }
}
