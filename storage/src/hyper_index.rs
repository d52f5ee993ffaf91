use crate::index::{AdjacencyGraph, FtsIndex, HnswIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// HyperIndex combines the vector index, the keyword (FTS) index, and the
/// graph index with an alias map for cross-referencing (e.g. entity
/// resolution).
pub struct HyperIndex {
    pub vector_index: HnswIndex,
    pub fts_index: Arc<FtsIndex>,
    pub graph_index: AdjacencyGraph,
    id_aliases: HashMap<String, u64>,
}

impl HyperIndex {
    pub fn new() -> Self {
        Self {
            vector_index: HnswIndex::new(),
            fts_index: Arc::new(FtsIndex::create_in_ram().expect("in-ram fts index")),
            graph_index: AdjacencyGraph::new(),
            id_aliases: HashMap::new(),
        }
    }

    pub fn with_fts_index(fts_index: Arc<FtsIndex>) -> Self {
        Self {
            vector_index: HnswIndex::new(),
            fts_index,
            graph_index: AdjacencyGraph::new(),
            id_aliases: HashMap::new(),
        }
    }

    pub fn insert_node(&mut self, id: u64, embedding: Vec<f32>) {
        if !embedding.is_empty() {
            self.vector_index.insert(id, embedding);
        }
    }

    /// Indexes `content` for keyword search under `chunk_id`. Call sites in
    /// `repo.rs` only do this for chunk-kind nodes; entity/document nodes
    /// have no text body to tokenise.
    pub fn index_content(&self, chunk_id: u64, content: &str) {
        let _ = self.fts_index.upsert(chunk_id, content);
    }

    pub fn remove_content(&self, chunk_id: u64) {
        let _ = self.fts_index.delete(chunk_id);
    }

    pub fn insert_edge(&mut self, source: u64, target: u64, relation: impl Into<String>, weight: f32) {
        self.graph_index.add_edge(source, target, relation, weight);
    }

    pub fn upsert_edge(&mut self, source: u64, target: u64, relation: impl Into<String>, weight: f32) {
        self.graph_index.upsert_edge(source, target, relation, weight);
    }

    pub fn remove_node(&mut self, id: u64) {
        self.vector_index.delete(id);
        self.remove_content(id);
        self.graph_index.remove_node(id);
        self.id_aliases.retain(|_, v| *v != id);
    }

    pub fn register_alias(&mut self, alias: impl Into<String>, id: u64) {
        self.id_aliases.insert(alias.into(), id);
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<u64> {
        self.id_aliases.get(alias).copied()
    }

    /// Vector search: find top-k similar nodes.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        self.vector_index.search(query, k)
    }

    /// Keyword (BM25) search over indexed chunk content.
    pub fn search_keyword(&self, query_text: &str, k: usize) -> Vec<(u64, f32)> {
        self.fts_index.search(query_text, k).unwrap_or_default()
    }

    /// Graph expansion: get neighbors up to max_hops.
    pub fn expand_graph(&self, id: u64, max_hops: u8) -> Vec<(u64, u8)> {
        self.graph_index.expand(id, max_hops)
    }
}

impl Default for HyperIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyper_index_vector_graph() {
        let mut index = HyperIndex::new();

        index.insert_node(1, vec![1.0, 0.0]);
        index.insert_node(2, vec![0.0, 1.0]);
        index.insert_edge(1, 2, "related", 1.0);

        let results = index.search_vector(&[1.0, 0.0], 1);
        assert_eq!(results[0].0, 1);

        let neighbors = index.expand_graph(1, 1);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, 2);
    }

    #[test]
    fn test_hyper_index_alias() {
        let mut index = HyperIndex::new();
        index.insert_node(1, vec![1.0]);
        index.register_alias("Alice", 1);

        assert_eq!(index.resolve_alias("Alice"), Some(1));
        assert_eq!(index.resolve_alias("Bob"), None);
    }

    #[test]
    fn test_hyper_index_keyword_search() {
        let index = HyperIndex::new();
        index.index_content(1, "position sizing and risk management");

        let results = index.search_keyword("risk management", 5);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_hyper_index_upsert_edge_is_idempotent() {
        let mut index = HyperIndex::new();
        index.insert_node(1, vec![1.0]);
        index.insert_node(2, vec![0.0]);
        index.upsert_edge(1, 2, "mentions", 0.4);
        index.upsert_edge(1, 2, "mentions", 0.8);

        let neighbors = index.expand_graph(1, 1);
        assert_eq!(neighbors.len(), 1);
    }
}
