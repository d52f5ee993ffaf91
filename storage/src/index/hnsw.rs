//! Cosine-distance HNSW vector index.
//!
//! Backed by `usearch` when the `hnsw` feature is enabled (the default);
//! falls back to a brute-force linear scan otherwise so the crate still
//! builds on platforms without a prebuilt `usearch` binding. The two paths
//! share the same public surface so `Repository`/`HyperIndex` never need to
//! know which one is active.
//!
//! Dimensionality is fixed at first insert and immutable afterward, so the
//! public `HnswIndex` defers construction of the real backend until it sees
//! its first embedding.

use std::collections::HashMap;

/// Default capacity reservation; grown on demand when exceeded.
const DEFAULT_CAPACITY: usize = 200_000;

#[cfg(feature = "hnsw")]
mod backend {
    use super::DEFAULT_CAPACITY;
    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    pub struct FixedDimIndex {
        index: Index,
        dims: usize,
        len: usize,
    }

    impl FixedDimIndex {
        pub fn new(dims: usize) -> Self {
            let options = IndexOptions {
                dimensions: dims,
                metric: MetricKind::Cos,
                quantization: ScalarKind::F32,
                ..Default::default()
            };
            let index = Index::new(&options).expect("failed to allocate usearch index");
            index
                .reserve(DEFAULT_CAPACITY)
                .expect("failed to reserve usearch capacity");
            Self { index, dims, len: 0 }
        }

        pub fn insert(&mut self, id: u64, embedding: &[f32]) {
            debug_assert_eq!(embedding.len(), self.dims);
            if self.index.size() >= self.index.capacity() {
                let _ = self.index.reserve(self.index.capacity() * 2);
            }
            if self.index.contains(id) {
                let _ = self.index.remove(id);
                self.len = self.len.saturating_sub(1);
            }
            if self.index.add(id, embedding).is_ok() {
                self.len += 1;
            }
        }

        pub fn delete(&mut self, id: u64) -> bool {
            if self.index.remove(id).unwrap_or(0) > 0 {
                self.len = self.len.saturating_sub(1);
                true
            } else {
                false
            }
        }

        pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
            if k == 0 {
                return Vec::new();
            }
            match self.index.search(query, k) {
                Ok(matches) => matches
                    .keys
                    .into_iter()
                    .zip(matches.distances)
                    .map(|(id, distance)| (id, 1.0 - distance))
                    .collect(),
                Err(_) => Vec::new(),
            }
        }

        /// Enumerate every rowid currently present, used by `HnswRebuilder`
        /// and `IntegrityChecker` instead of the SQL-side
        /// knn-against-zero-vector trick some vector databases require when
        /// they can't enumerate a virtual table directly.
        pub fn all_ids(&self) -> Vec<u64> {
            (0..self.index.size())
                .filter_map(|slot| self.index.key_at(slot).ok())
                .collect()
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn dims(&self) -> usize {
            self.dims
        }
    }
}

#[cfg(not(feature = "hnsw"))]
mod backend {
    pub struct FixedDimIndex {
        embeddings: std::collections::HashMap<u64, Vec<f32>>,
        dims: usize,
    }

    impl FixedDimIndex {
        pub fn new(dims: usize) -> Self {
            Self {
                embeddings: std::collections::HashMap::new(),
                dims,
            }
        }

        pub fn insert(&mut self, id: u64, embedding: &[f32]) {
            self.embeddings.insert(id, embedding.to_vec());
        }

        pub fn delete(&mut self, id: u64) -> bool {
            self.embeddings.remove(&id).is_some()
        }

        pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
            let mut scores: Vec<(u64, f32)> = self
                .embeddings
                .iter()
                .filter_map(|(id, emb)| super::cosine_similarity(query, emb).map(|s| (*id, s)))
                .collect();
            scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scores.truncate(k);
            scores
        }

        pub fn all_ids(&self) -> Vec<u64> {
            self.embeddings.keys().copied().collect()
        }

        pub fn len(&self) -> usize {
            self.embeddings.len()
        }

        pub fn dims(&self) -> usize {
            self.dims
        }
    }
}

/// Cosine HNSW index with deferred, first-insert-fixed dimensionality.
pub struct HnswIndex {
    inner: Option<backend::FixedDimIndex>,
}

impl HnswIndex {
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Pre-fixes dimensionality, e.g. when restoring from a backup snapshot
    /// whose embeddings are known ahead of the first `insert`.
    pub fn with_dims(dims: usize) -> Self {
        Self {
            inner: Some(backend::FixedDimIndex::new(dims)),
        }
    }

    pub fn insert(&mut self, id: u64, embedding: Vec<f32>) {
        if self.inner.is_none() {
            self.inner = Some(backend::FixedDimIndex::new(embedding.len()));
        }
        self.inner.as_mut().expect("just initialised").insert(id, &embedding);
    }

    pub fn delete(&mut self, id: u64) -> bool {
        self.inner.as_mut().map(|i| i.delete(id)).unwrap_or(false)
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        self.inner.as_ref().map(|i| i.search(query, k)).unwrap_or_default()
    }

    pub fn all_ids(&self) -> Vec<u64> {
        self.inner.as_ref().map(|i| i.all_ids()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> Option<usize> {
        self.inner.as_ref().map(|i| i.dims())
    }
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}

/// Retained for the dimension-inference call sites in `repo.rs` that used
/// to read `LinearAnnIndex`'s embedding map directly.
pub fn infer_dims(existing: &HashMap<u64, Vec<f32>>) -> Option<usize> {
    existing.values().next().map(|v| v.len())
}
