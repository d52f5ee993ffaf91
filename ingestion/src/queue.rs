//! Priority ingestion queue.
//!
//! Every path that can produce work for the pipeline coordinator — the
//! file-system watcher, the startup self-healer, and any future CLI/API
//! surface — funnels through a single `IndexingQueue` so priority ordering
//! and path de-duplication happen in one place. Grounded in the same
//! `tokio::sync` idiom `jobs::worker::Worker` already uses for its
//! single-consumer channel, generalised here to a priority heap since the
//! coordinator needs HIGH-priority self-heal work to jump ahead of
//! NORMAL-priority watcher events.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Lower values are served first. `Urgent` jumps every other item in the
/// heap; `Low` only runs once nothing higher-priority is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub path: PathBuf,
    pub priority: Priority,
    /// Re-ingest even if the path is already indexed at its current content
    /// hash (self-heal / manual reindex paths set this).
    pub force: bool,
    sequence: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl Ord for QueueItem {
    /// `BinaryHeap` is a max-heap, so "should pop first" must compare
    /// greater. Lower `Priority` values (`Urgent`) and lower sequence
    /// numbers (enqueued earlier) should pop first, hence both comparisons
    /// are reversed relative to their natural ordering.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<QueueItem>,
    tracked: HashSet<PathBuf>,
    paused: bool,
}

/// Bounded by nothing but memory — callers are expected to size worker
/// pools rather than the queue itself, per the coordinator's bounded
/// mpsc channels downstream.
pub struct IndexingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    sequence: AtomicU64,
}

impl IndexingQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                tracked: HashSet::new(),
                paused: false,
            }),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Enqueues `path` at `priority`. Returns `false` without enqueueing if
    /// the path is already tracked (enqueued or mid-processing) — the
    /// dedup contract the watcher relies on to avoid piling up duplicate
    /// work for a file that fires several debounced events in a row.
    pub async fn add(&self, path: impl Into<PathBuf>, priority: Priority, force: bool) -> bool {
        let path = path.into();
        let mut state = self.state.lock().await;
        if state.tracked.contains(&path) {
            return false;
        }
        state.tracked.insert(path.clone());
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        state.heap.push(QueueItem {
            path,
            priority,
            force,
            sequence,
        });
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Blocks (up to `timeout`) for the next item, honouring `pause`. A
    /// `None` return means the timeout elapsed with nothing available, not
    /// that the queue is permanently empty — callers loop on this.
    pub async fn get(&self, timeout: Duration) -> Option<QueueItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.paused {
                    if let Some(item) = state.heap.pop() {
                        return Some(item);
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    /// Clears the dedup tracking entry so a future `add` for this path is
    /// accepted again. Called once a file finishes processing, whatever
    /// the outcome.
    pub async fn mark_complete(&self, path: &Path) {
        let mut state = self.state.lock().await;
        state.tracked.remove(path);
    }

    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.heap.clear();
        state.tracked.clear();
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }
}

impl Default for IndexingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_priority_pops_first() {
        let queue = IndexingQueue::new();
        queue.add("normal.md", Priority::Normal, false).await;
        queue.add("urgent.md", Priority::Urgent, false).await;
        queue.add("low.md", Priority::Low, false).await;

        let first = queue.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.path, PathBuf::from("urgent.md"));
    }

    #[tokio::test]
    async fn same_priority_is_fifo() {
        let queue = IndexingQueue::new();
        queue.add("a.md", Priority::Normal, false).await;
        queue.add("b.md", Priority::Normal, false).await;

        let first = queue.get(Duration::from_millis(50)).await.unwrap();
        let second = queue.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.path, PathBuf::from("a.md"));
        assert_eq!(second.path, PathBuf::from("b.md"));
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected_until_complete() {
        let queue = IndexingQueue::new();
        assert!(queue.add("note.md", Priority::Normal, false).await);
        assert!(!queue.add("note.md", Priority::High, false).await);

        let item = queue.get(Duration::from_millis(50)).await.unwrap();
        queue.mark_complete(&item.path).await;

        assert!(queue.add("note.md", Priority::Normal, false).await);
    }

    #[tokio::test]
    async fn get_times_out_on_empty_queue() {
        let queue = IndexingQueue::new();
        let result = queue.get(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn paused_queue_yields_nothing_until_resumed() {
        let queue = IndexingQueue::new();
        queue.add("note.md", Priority::Normal, false).await;
        queue.pause().await;

        assert!(queue.get(Duration::from_millis(20)).await.is_none());

        queue.resume().await;
        assert!(queue.get(Duration::from_millis(50)).await.is_some());
    }

    #[tokio::test]
    async fn clear_drops_items_and_tracking() {
        let queue = IndexingQueue::new();
        queue.add("note.md", Priority::Normal, false).await;
        queue.clear().await;

        assert!(queue.is_empty().await);
        assert!(queue.add("note.md", Priority::Normal, false).await);
    }
}
