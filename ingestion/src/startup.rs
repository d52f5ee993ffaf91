//! Self-healing sequence run once at process start, before the watcher
//! or any API surface accepts new work.
//!
//! Order matters: resuming crashed-mid-ingest files before scanning for
//! brand-new ones means a partially-chunked document gets priority over
//! a backlog of untouched files, and repairing orphaned index entries
//! before reindexing means the reindex doesn't race a rebuild that's
//! still cleaning up stale vectors.

use crate::progress::ProgressTracker;
use crate::queue::{IndexingQueue, Priority};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::recovery::{OrphanCleaner, RecoveryOperation};
use storage::repo::{RepoError, Repository};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub resumed: usize,
    pub orphans_repaired: usize,
    pub empty_documents_healed: usize,
    pub new_files_queued: usize,
}

/// Runs the startup self-heal sequence against `repo`, `progress` and
/// `queue`, walking `watch_root` for files not yet represented in the
/// index. Every step is best-effort: a failure in one step is logged and
/// does not prevent the remaining steps from running, since leaving the
/// system only partially healed is better than refusing to start.
pub struct StartupManager {
    repo: Arc<Repository>,
    progress: Arc<ProgressTracker>,
    queue: Arc<IndexingQueue>,
}

impl StartupManager {
    pub fn new(repo: Arc<Repository>, progress: Arc<ProgressTracker>, queue: Arc<IndexingQueue>) -> Self {
        Self {
            repo,
            progress,
            queue,
        }
    }

    pub async fn run(&self, watch_root: &Path) -> Result<StartupReport, RepoError> {
        let mut report = StartupReport::default();

        report.resumed = self.resume_in_progress().await;
        report.orphans_repaired = self.repair_orphans().await?;
        report.empty_documents_healed = self.heal_empty_documents().await;
        report.new_files_queued = self.index_new_files(watch_root).await;

        tracing::info!(
            resumed = report.resumed,
            orphans_repaired = report.orphans_repaired,
            empty_documents_healed = report.empty_documents_healed,
            new_files_queued = report.new_files_queued,
            "startup self-heal complete"
        );

        Ok(report)
    }

    /// Files still `InProgress` at startup crashed mid-pipeline. They
    /// re-enter the queue at `High` priority, ahead of the ordinary
    /// watcher backlog but behind nothing more urgent.
    async fn resume_in_progress(&self) -> usize {
        let stuck = self.progress.in_progress_paths();
        for path in &stuck {
            self.queue.add(PathBuf::from(path), Priority::High, true).await;
        }
        stuck.len()
    }

    /// Index entries (vector/keyword/graph) with no backing node are
    /// dropped via the shared recovery operation rather than reimplemented
    /// here.
    async fn repair_orphans(&self) -> Result<usize, RepoError> {
        let cleaner = OrphanCleaner::new(Arc::clone(&self.repo));
        let stats = cleaner.run(false).await?;
        Ok(stats.repaired)
    }

    /// A node whose `data` is empty (extraction succeeded but produced
    /// nothing, or was truncated by a crash before content was written)
    /// is re-queued for re-ingestion at `High` priority rather than left
    /// as permanent dead weight in the index.
    async fn heal_empty_documents(&self) -> usize {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        let mut healed = 0;
        for node in nodes {
            if node.data.trim().is_empty() {
                if let Some(path) = node.metadata.get("file_path") {
                    self.queue.add(PathBuf::from(path), Priority::High, true).await;
                    healed += 1;
                }
            }
        }
        healed
    }

    /// Walks `watch_root` for files the index has no record of yet,
    /// queuing each at `Normal` priority. Relies on the coordinator's
    /// queue-level path dedup to skip anything already in flight from
    /// `resume_in_progress`/`heal_empty_documents`.
    async fn index_new_files(&self, watch_root: &Path) -> usize {
        if !watch_root.exists() {
            return 0;
        }

        let known_paths = self.known_file_paths().await;
        let mut queued = 0;
        for entry in WalkDir::new(watch_root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.path().to_path_buf();
            let path_str = path.to_string_lossy().to_string();
            if known_paths.contains(&path_str) {
                continue;
            }
            if self.queue.add(path, Priority::Normal, false).await {
                queued += 1;
            }
        }
        queued
    }

    async fn known_file_paths(&self) -> std::collections::HashSet<String> {
        let ids = self.repo.list_node_ids().await;
        let nodes = self.repo.get_nodes_by_ids(&ids).await;
        nodes
            .into_iter()
            .filter_map(|node| node.metadata.get("file_path").cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_repo(dir: &Path) -> Arc<Repository> {
        Arc::new(Repository::open(dir.join("wal.log")).await.unwrap())
    }

    #[tokio::test]
    async fn resumes_in_progress_files_at_high_priority() {
        let dir = tempdir().unwrap();
        let repo = test_repo(dir.path()).await;
        let progress = Arc::new(ProgressTracker::new());
        let queue = Arc::new(IndexingQueue::new());

        progress.start("stuck.md", "hash1");

        let manager = StartupManager::new(repo, progress, queue.clone());
        let report = manager.run(dir.path()).await.unwrap();

        assert_eq!(report.resumed, 1);
        let item = queue.get(std::time::Duration::from_millis(50)).await.unwrap();
        assert_eq!(item.priority, Priority::High);
    }

    #[tokio::test]
    async fn queues_new_files_found_on_disk() {
        let dir = tempdir().unwrap();
        let watch_dir = dir.path().join("notes");
        tokio::fs::create_dir_all(&watch_dir).await.unwrap();
        tokio::fs::write(watch_dir.join("a.md"), b"hello").await.unwrap();

        let repo = test_repo(dir.path()).await;
        let progress = Arc::new(ProgressTracker::new());
        let queue = Arc::new(IndexingQueue::new());

        let manager = StartupManager::new(repo, progress, queue.clone());
        let report = manager.run(&watch_dir).await.unwrap();

        assert_eq!(report.new_files_queued, 1);
        assert_eq!(queue.size().await, 1);
    }
}
