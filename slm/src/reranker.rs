use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashSet;

/// One hybrid-search hit offered up for cross-encoder reranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankCandidate {
    pub id: u64,
    pub text: String,
    pub original_score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankedCandidate {
    pub id: u64,
    pub score: f32,
}

/// Query-aware re-scoring pass applied to a shortlist of hybrid search hits.
/// The real deployment swaps this for an actual cross-encoder; everything
/// downstream only depends on candidates coming back sorted by `score` desc.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> anyhow::Result<Vec<RerankedCandidate>>;
}

/// Lexical-overlap stand-in for a real cross-encoder, in the same spirit as
/// `ragkb_core::embedding::deterministic_embedding`: deterministic, has no
/// external model dependency, and keeps the reranking seam real for callers.
pub struct DeterministicReranker;

#[async_trait]
impl Reranker for DeterministicReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> anyhow::Result<Vec<RerankedCandidate>> {
        let query_tokens = tokenize(query);

        let mut scored: Vec<RerankedCandidate> = candidates
            .iter()
            .map(|candidate| {
                let overlap = token_overlap(&query_tokens, &tokenize(&candidate.text));
                let score = (overlap * 0.7) + (candidate.original_score * 0.3);
                RerankedCandidate {
                    id: candidate.id,
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        Ok(scored)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut buffer = String::new();

    for ch in text.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_alphanumeric() {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            out.insert(std::mem::take(&mut buffer));
        }
    }
    if !buffer.is_empty() {
        out.insert(buffer);
    }

    out
}

fn token_overlap(query_tokens: &HashSet<String>, candidate_tokens: &HashSet<String>) -> f32 {
    if query_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }

    let intersection = query_tokens.intersection(candidate_tokens).count() as f32;
    intersection / query_tokens.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reranker_prefers_lexical_overlap_over_original_score() {
        let reranker = DeterministicReranker;
        let candidates = vec![
            RerankCandidate {
                id: 1,
                text: "Toyota expands EV battery production".to_string(),
                original_score: 0.1,
            },
            RerankCandidate {
                id: 2,
                text: "unrelated quarterly earnings report".to_string(),
                original_score: 0.9,
            },
        ];

        let ranked = reranker
            .rerank("Toyota EV battery", &candidates)
            .await
            .unwrap();

        assert_eq!(ranked[0].id, 1);
    }

    #[tokio::test]
    async fn reranker_is_stable_under_empty_candidates() {
        let reranker = DeterministicReranker;
        let ranked = reranker.rerank("anything", &[]).await.unwrap();
        assert!(ranked.is_empty());
    }
}
