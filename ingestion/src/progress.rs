//! In-memory `processing_progress` tracker.
//!
//! Written at every pipeline stage boundary so the startup self-healer can
//! tell a file that crashed mid-ingest (`InProgress` at restart) apart from
//! one that was never queued at all. Modeled as its own `DashMap`-backed
//! table rather than a `Node` with `metadata["kind"] == "progress"`, since
//! progress rows churn on every chunk/embed/store step and don't belong in
//! the same WAL-replayed consistency domain as document content.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    InProgress,
    Completed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ProcessingProgress {
    pub file_path: String,
    pub content_hash: Option<String>,
    pub total_chunks: usize,
    pub chunks_processed: usize,
    pub status: ProcessingStatus,
    pub last_chunk_end: Option<usize>,
    pub error_message: Option<String>,
    pub started_at: u64,
    pub last_updated: u64,
    pub completed_at: Option<u64>,
}

impl ProcessingProgress {
    fn new(file_path: String) -> Self {
        let now = now_unix();
        Self {
            file_path,
            content_hash: None,
            total_chunks: 0,
            chunks_processed: 0,
            status: ProcessingStatus::InProgress,
            last_chunk_end: None,
            error_message: None,
            started_at: now,
            last_updated: now,
            completed_at: None,
        }
    }
}

pub struct ProgressTracker {
    entries: DashMap<String, ProcessingProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn start(&self, file_path: impl Into<String>, content_hash: impl Into<String>) {
        let file_path = file_path.into();
        let mut progress = ProcessingProgress::new(file_path.clone());
        progress.content_hash = Some(content_hash.into());
        self.entries.insert(file_path, progress);
    }

    pub fn record_chunked(&self, file_path: &str, total_chunks: usize) {
        if let Some(mut entry) = self.entries.get_mut(file_path) {
            entry.total_chunks = total_chunks;
            entry.last_updated = now_unix();
        }
    }

    /// Updates the running count of chunks stored so far without
    /// declaring the document finished — callers finalize separately via
    /// [`ProgressTracker::record_stored`] once `chunks_processed` reaches
    /// `total_chunks`, since the store worker sees one chunk at a time.
    pub fn record_chunk_progress(&self, file_path: &str, chunks_processed: usize) {
        if let Some(mut entry) = self.entries.get_mut(file_path) {
            entry.chunks_processed = chunks_processed;
            entry.last_chunk_end = Some(chunks_processed);
            entry.last_updated = now_unix();
        }
    }

    pub fn record_stored(&self, file_path: &str, chunks_processed: usize) {
        if let Some(mut entry) = self.entries.get_mut(file_path) {
            entry.chunks_processed = chunks_processed;
            entry.last_chunk_end = Some(chunks_processed);
            entry.status = ProcessingStatus::Completed;
            let now = now_unix();
            entry.last_updated = now;
            entry.completed_at = Some(now);
        }
    }

    pub fn record_failed(&self, file_path: &str, error_message: impl Into<String>) {
        self.set_terminal(file_path, ProcessingStatus::Failed, error_message);
    }

    pub fn record_rejected(&self, file_path: &str, reason: impl Into<String>) {
        self.set_terminal(file_path, ProcessingStatus::Rejected, reason);
    }

    fn set_terminal(&self, file_path: &str, status: ProcessingStatus, message: impl Into<String>) {
        if let Some(mut entry) = self.entries.get_mut(file_path) {
            entry.status = status;
            entry.error_message = Some(message.into());
            entry.last_updated = now_unix();
        } else {
            let mut progress = ProcessingProgress::new(file_path.to_string());
            progress.status = status;
            progress.error_message = Some(message.into());
            self.entries.insert(file_path.to_string(), progress);
        }
    }

    pub fn get(&self, file_path: &str) -> Option<ProcessingProgress> {
        self.entries.get(file_path).map(|entry| entry.clone())
    }

    /// Rows stuck `InProgress` across a restart — the self-healer re-queues
    /// these at `Priority::High`.
    pub fn in_progress_paths(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.status == ProcessingStatus::InProgress)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle_to_completion() {
        let tracker = ProgressTracker::new();
        tracker.start("doc.md", "hash1");
        tracker.record_chunked("doc.md", 3);
        tracker.record_stored("doc.md", 3);

        let progress = tracker.get("doc.md").unwrap();
        assert_eq!(progress.status, ProcessingStatus::Completed);
        assert_eq!(progress.chunks_processed, 3);
        assert!(progress.completed_at.is_some());
    }

    #[test]
    fn in_progress_paths_excludes_completed() {
        let tracker = ProgressTracker::new();
        tracker.start("stuck.md", "hash1");
        tracker.start("done.md", "hash2");
        tracker.record_stored("done.md", 1);

        let stuck = tracker.in_progress_paths();
        assert_eq!(stuck, vec!["stuck.md".to_string()]);
    }

    #[test]
    fn record_failed_without_prior_start_creates_entry() {
        let tracker = ProgressTracker::new();
        tracker.record_failed("broken.md", "extraction failed");

        let progress = tracker.get("broken.md").unwrap();
        assert_eq!(progress.status, ProcessingStatus::Failed);
        assert_eq!(progress.error_message.as_deref(), Some("extraction failed"));
    }
}
