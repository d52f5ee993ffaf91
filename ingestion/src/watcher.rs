//! File-system watcher that feeds the ingestion queue.
//!
//! `notify-debouncer-full` coalesces the burst of raw OS events a single
//! save produces (write + metadata + close) into one debounced batch, so
//! the queue sees one `add` per edit rather than three. New and modified
//! files enqueue at `Priority::Normal`; removals are not queued — the
//! startup self-healer's orphan cleanup (not this watcher) is responsible
//! for reconciling deletions against the index.

use crate::queue::{IndexingQueue, Priority};
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher setup failed: {0}")]
    Notify(#[from] notify::Error),
}

/// Extensions the watcher will enqueue. Anything else (temp files, lock
/// files, `.DS_Store`) is ignored at the source rather than relying on
/// the validation chain to reject it later.
const WATCHED_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "pdf", "docx", "epub", "ipynb", "rs", "py", "js", "jsx", "mjs", "ts",
    "tsx", "go", "json",
];

fn is_watched(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| WATCHED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Owns the underlying OS watch handle and the background task draining
/// debounced events into the ingestion queue. Dropping this drops the
/// watch.
pub struct FileWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher, FileIdMap>,
}

impl FileWatcher {
    /// Watches `root` recursively, debouncing events over `debounce`
    /// (the original system's default is 2 seconds) and forwarding
    /// matching paths to `queue` at `Priority::Normal`.
    pub fn watch(
        root: impl AsRef<Path>,
        queue: Arc<IndexingQueue>,
        debounce: Duration,
    ) -> Result<Self, WatcherError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            if let Ok(events) = result {
                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .flat_map(|event| event.paths)
                    .filter(|path| is_watched(path))
                    .collect();
                if !paths.is_empty() {
                    let _ = tx.send(paths);
                }
            }
        })?;

        debouncer
            .watcher()
            .watch(root.as_ref(), RecursiveMode::Recursive)?;

        tokio::spawn(async move {
            while let Some(paths) = rx.recv().await {
                for path in paths {
                    queue.add(path, Priority::Normal, false).await;
                }
            }
        });

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}
