use ragkb_core::config::SearchConfig;
use ragkb_core::embedding::deterministic_embedding;
use ragkb_core::model::Node;
use slm::decompose::{decompose_query, DecompositionResult};
use slm::reranker::{RerankCandidate, Reranker};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use storage::repo::Repository;
use thiserror::Error;

const DEFAULT_EMBEDDING_MODEL_ID: &str = "embedding-default-v1";
const DEFAULT_TOP_K: usize = 20;
const CANDIDATE_FANOUT: usize = 4;

/// Request for the primary hybrid search entry point: vector search union
/// keyword search, fused by reciprocal rank, with optional rerank and
/// compound-query decomposition.
#[derive(Debug, Clone)]
pub struct HybridSearchRequest {
    pub query: String,
    pub top_k: usize,
    pub threshold: Option<f32>,
    pub use_hybrid: bool,
    pub decompose: bool,
    pub model_id: Option<String>,
    /// Attach each hit's 1-hop graph neighborhood to the response. Off by
    /// default: it costs one extra index read per surviving hit and most
    /// callers only want ranked passages.
    pub include_graph_context: bool,
}

impl HybridSearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

impl Default for HybridSearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            top_k: DEFAULT_TOP_K,
            threshold: None,
            use_hybrid: true,
            decompose: false,
            model_id: None,
            include_graph_context: false,
        }
    }
}

/// One graph neighbor of a hit's node, at `hops` distance. Grounded in
/// `AdjacencyGraph::expand`'s `(node_id, distance)` BFS result shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNeighbor {
    pub node_id: u64,
    pub hops: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HybridSearchHit {
    pub node_id: u64,
    pub content: String,
    pub source: Option<String>,
    pub score: f32,
    pub vector_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
    pub graph_context: Vec<GraphNeighbor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionReport {
    pub applied: bool,
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HybridSearchResponse {
    pub hits: Vec<HybridSearchHit>,
    pub decomposition: DecompositionReport,
    pub reranked: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HybridSearchError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("top_k must be greater than zero")]
    InvalidTopK,
}

/// Primary search surface over a `Repository`'s dual-index (`HyperIndex`
/// vector + keyword search, fused by RRF). This sits alongside
/// `QueryEngine`'s GraphRAG reasoning path rather than replacing it: callers
/// that just want ranked passages use `SearchService`, callers that want
/// evidence subgraphs/citations/groundedness use `QueryEngine`.
pub struct SearchService {
    repo: Arc<Repository>,
    config: SearchConfig,
    reranker: Option<Arc<dyn Reranker>>,
}

impl SearchService {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            config: SearchConfig::default(),
            reranker: None,
        }
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub async fn search(
        &self,
        request: HybridSearchRequest,
    ) -> Result<HybridSearchResponse, HybridSearchError> {
        if request.query.trim().is_empty() {
            return Err(HybridSearchError::EmptyQuery);
        }
        if request.top_k == 0 {
            return Err(HybridSearchError::InvalidTopK);
        }

        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL_ID.to_string());

        let decomposition = if request.decompose {
            decompose_query(&request.query)
        } else {
            DecompositionResult {
                applied: false,
                sub_queries: Vec::new(),
            }
        };

        let mut hits = if decomposition.applied {
            self.search_decomposed(&decomposition.sub_queries, &request, &model_id)
                .await
        } else {
            self.search_once(&request.query, &request, &model_id).await
        };

        let reranked = self.maybe_rerank(&request.query, &mut hits).await;

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.node_id.cmp(&b.node_id))
        });

        if let Some(threshold) = request.threshold {
            hits.retain(|hit| hit.score >= threshold);
        }

        hits.truncate(request.top_k);

        Ok(HybridSearchResponse {
            hits,
            decomposition: DecompositionReport {
                applied: decomposition.applied,
                sub_queries: decomposition.sub_queries,
            },
            reranked,
        })
    }

    /// Runs every sub-query independently, then unions the results, keeping
    /// the highest-scoring hit when the same (source, content prefix) shows
    /// up from more than one sub-query.
    async fn search_decomposed(
        &self,
        sub_queries: &[String],
        request: &HybridSearchRequest,
        model_id: &str,
    ) -> Vec<HybridSearchHit> {
        let mut merged: HashMap<(Option<String>, String), HybridSearchHit> = HashMap::new();

        for sub_query in sub_queries {
            let sub_hits = self.search_once(sub_query, request, model_id).await;
            for hit in sub_hits {
                let key = (hit.source.clone(), content_prefix(&hit.content));
                merged
                    .entry(key)
                    .and_modify(|existing| {
                        if hit.score > existing.score {
                            *existing = hit.clone();
                        }
                    })
                    .or_insert(hit);
            }
        }

        merged.into_values().collect()
    }

    async fn maybe_rerank(&self, query: &str, hits: &mut [HybridSearchHit]) -> bool {
        let Some(reranker) = &self.reranker else {
            return false;
        };
        if hits.is_empty() {
            return false;
        }

        let candidates: Vec<RerankCandidate> = hits
            .iter()
            .map(|hit| RerankCandidate {
                id: hit.node_id,
                text: hit.content.clone(),
                original_score: hit.score,
            })
            .collect();

        let Ok(reranked) = reranker.rerank(query, &candidates).await else {
            return false;
        };

        let score_by_id: HashMap<u64, f32> = reranked
            .into_iter()
            .map(|candidate| (candidate.id, candidate.score))
            .collect();

        for hit in hits.iter_mut() {
            if let Some(score) = score_by_id.get(&hit.node_id) {
                hit.score = *score;
            }
        }

        true
    }

    async fn search_once(
        &self,
        query_text: &str,
        request: &HybridSearchRequest,
        model_id: &str,
    ) -> Vec<HybridSearchHit> {
        let fanout = request.top_k.saturating_mul(CANDIDATE_FANOUT).max(request.top_k);

        let vector_hits = match self.repo.embedding_dimension().await {
            Some(dims) => {
                let embedding = deterministic_embedding(query_text, model_id, dims);
                let index = self.repo.hyper_index.read().await;
                index.search_vector(&embedding, fanout)
            }
            None => Vec::new(),
        };

        let keyword_hits = if request.use_hybrid {
            let index = self.repo.hyper_index.read().await;
            index.search_keyword(query_text, fanout)
        } else {
            Vec::new()
        };

        let fused = reciprocal_rank_fusion(&vector_hits, &keyword_hits, self.config.rrf_k);
        let candidate_ids: Vec<u64> = fused.iter().map(|hit| hit.node_id).collect();
        let nodes = self.repo.get_nodes_by_ids(&candidate_ids).await;
        let node_lookup: HashMap<u64, Node> =
            nodes.into_iter().map(|node| (node.id, node)).collect();

        let mut hits: Vec<HybridSearchHit> = fused
            .into_iter()
            .filter_map(|fused_hit| {
                let node = node_lookup.get(&fused_hit.node_id)?;
                Some(HybridSearchHit {
                    node_id: fused_hit.node_id,
                    content: node.data.clone(),
                    source: ragkb_core::model::resolve_source(&node.metadata),
                    score: fused_hit.score,
                    vector_rank: fused_hit.vector_rank,
                    keyword_rank: fused_hit.keyword_rank,
                    graph_context: Vec::new(),
                })
            })
            .collect();

        if request.include_graph_context {
            self.attach_graph_context(&mut hits).await;
        }

        hits
    }

    /// Fills in each hit's 1-hop graph neighborhood from the shared
    /// `AdjacencyGraph`, so a caller can show "related notes" alongside a
    /// ranked passage without a second round trip.
    async fn attach_graph_context(&self, hits: &mut [HybridSearchHit]) {
        let index = self.repo.hyper_index.read().await;
        for hit in hits.iter_mut() {
            hit.graph_context = index
                .expand_graph(hit.node_id, 1)
                .into_iter()
                .map(|(node_id, hops)| GraphNeighbor { node_id, hops })
                .collect();
        }
    }
}

struct FusedHit {
    node_id: u64,
    score: f32,
    vector_rank: Option<usize>,
    keyword_rank: Option<usize>,
}

/// Reciprocal Rank Fusion: `score(d) = sum over lists containing d of 1 /
/// (rrf_k + rank(d) + 1)`. Items that show up in both lists accumulate both
/// terms, which is what lets hybrid search outrank either signal alone.
fn reciprocal_rank_fusion(
    vector_hits: &[(u64, f32)],
    keyword_hits: &[(u64, f32)],
    rrf_k: u32,
) -> Vec<FusedHit> {
    let k = rrf_k as f32;
    let mut scores: HashMap<u64, (f32, Option<usize>, Option<usize>)> = HashMap::new();

    for (rank, (node_id, _)) in vector_hits.iter().enumerate() {
        let entry = scores.entry(*node_id).or_insert((0.0, None, None));
        entry.0 += 1.0 / (k + rank as f32 + 1.0);
        entry.1 = Some(rank);
    }

    for (rank, (node_id, _)) in keyword_hits.iter().enumerate() {
        let entry = scores.entry(*node_id).or_insert((0.0, None, None));
        entry.0 += 1.0 / (k + rank as f32 + 1.0);
        entry.2 = Some(rank);
    }

    let mut out: Vec<FusedHit> = scores
        .into_iter()
        .map(|(node_id, (score, vector_rank, keyword_rank))| FusedHit {
            node_id,
            score,
            vector_rank,
            keyword_rank,
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.node_id.cmp(&b.node_id))
    });

    out
}

fn content_prefix(content: &str) -> String {
    content.chars().take(100).collect()
}
