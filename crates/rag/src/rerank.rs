use std::sync::Arc;
use std::time::Duration;

use knowhub_llm::GenerationService;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RerankDegraded;
use crate::model::{Candidate, RankedChunk};

static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

pub struct Reranker {
    llm: Arc<dyn GenerationService>,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RerankOutput {
    pub chunks: Vec<RankedChunk>,
    /// Set when the model's ordering could not be used.
    pub degraded: Option<RerankDegraded>,
}

impl Reranker {
    pub fn new(llm: Arc<dyn GenerationService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Reorders `candidates` by the model's judgement. Never fails: any
    /// problem yields the retrieval order truncated to `top_k`.
    pub async fn rerank(
        &self,
        candidates: Vec<Candidate>,
        question_text: &str,
        top_k: usize,
    ) -> Vec<RankedChunk> {
        self.rerank_detailed(candidates, question_text, top_k)
            .await
            .chunks
    }

    pub async fn rerank_detailed(
        &self,
        candidates: Vec<Candidate>,
        question_text: &str,
        top_k: usize,
    ) -> RerankOutput {
        if candidates.is_empty() || top_k == 0 {
            return RerankOutput {
                chunks: Vec::new(),
                degraded: None,
            };
        }
        let prompt = build_rerank_prompt(&candidates, question_text);
        let order = match timeout(self.timeout, self.llm.generate(&prompt)).await {
            Ok(Ok(response)) => {
                let order = parse_rerank_indices(&response, candidates.len());
                if order.is_empty() {
                    debug!(response = %response, "rerank response had no usable numbers");
                    Err(RerankDegraded::Unparseable)
                } else {
                    Ok(order)
                }
            }
            Ok(Err(err)) => Err(RerankDegraded::ServiceError(format!("{err:#}"))),
            Err(_) => Err(RerankDegraded::Timeout),
        };
        match order {
            Ok(order) => RerankOutput {
                chunks: select(candidates, &order, top_k),
                degraded: None,
            },
            Err(reason) => {
                warn!(reason = %reason, "rerank degraded, keeping retrieval order");
                RerankOutput {
                    chunks: fallback_order(candidates, top_k),
                    degraded: Some(reason),
                }
            }
        }
    }
}

pub fn build_rerank_prompt(candidates: &[Candidate], question_text: &str) -> String {
    let listing = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. {} (Chunk ID: {})",
                i + 1,
                c.fragment.text,
                c.fragment.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Given the following context chunks and the question, rank the chunks by relevance to the question.\n\
         Chunks:\n{listing}\n\nQuestion: {}\n\
         Return the most relevant chunk numbers as a comma-separated list.",
        question_text.trim()
    )
}

/// Scans `response` for integer tokens and maps them to 0-based candidate
/// positions. Out-of-range and repeated numbers are dropped; the model's
/// order is kept.
pub fn parse_rerank_indices(response: &str, candidate_count: usize) -> Vec<usize> {
    let mut seen = vec![false; candidate_count];
    INTEGER
        .find_iter(response)
        .filter_map(|m| m.as_str().parse::<usize>().ok())
        .filter(|n| (1..=candidate_count).contains(n))
        .map(|n| n - 1)
        .filter(|idx| !std::mem::replace(&mut seen[*idx], true))
        .collect()
}

fn select(candidates: Vec<Candidate>, order: &[usize], top_k: usize) -> Vec<RankedChunk> {
    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|idx| slots[*idx].take())
        .take(top_k)
        .enumerate()
        .map(|(relevance_rank, candidate)| RankedChunk {
            candidate,
            relevance_rank,
        })
        .collect()
}

fn fallback_order(candidates: Vec<Candidate>, top_k: usize) -> Vec<RankedChunk> {
    candidates
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(relevance_rank, candidate)| RankedChunk {
            candidate,
            relevance_rank,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fragment;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct Scripted(Result<String, String>);

    #[async_trait]
    impl GenerationService for Scripted {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    struct Hung;

    #[async_trait]
    impl GenerationService for Hung {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("1".to_string())
        }
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                fragment: Fragment {
                    id: format!("c{}", i + 1),
                    text: format!("chunk {}", i + 1),
                    source_document_id: "doc".to_string(),
                    domain_id: "d1".to_string(),
                },
                score: i as f32,
                rank: i,
            })
            .collect()
    }

    fn ids(chunks: &[RankedChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.fragment().id.as_str()).collect()
    }

    fn reranker(response: Result<&str, &str>) -> Reranker {
        Reranker::new(
            Arc::new(Scripted(
                response.map(str::to_string).map_err(str::to_string),
            )),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn parser_keeps_model_order_and_drops_out_of_range() {
        assert_eq!(parse_rerank_indices("3, 1, 0, 9, 2", 3), vec![2, 0, 1]);
        assert_eq!(parse_rerank_indices("Most relevant: #2 then #2 and 1.", 3), vec![1, 0]);
        assert!(parse_rerank_indices("none of them", 3).is_empty());
        assert!(parse_rerank_indices("99999999999999999999999", 3).is_empty());
    }

    #[test]
    fn prompt_numbers_candidates_from_one() {
        let prompt = build_rerank_prompt(&candidates(2), " what? ");
        assert!(prompt.contains("1. chunk 1 (Chunk ID: c1)"));
        assert!(prompt.contains("2. chunk 2 (Chunk ID: c2)"));
        assert!(prompt.contains("Question: what?\n"));
    }

    #[tokio::test]
    async fn model_order_is_applied_and_truncated() {
        let out = reranker(Ok("2, 1, 3"))
            .rerank_detailed(candidates(3), "q", 2)
            .await;
        assert_eq!(ids(&out.chunks), vec!["c2", "c1"]);
        assert_eq!(out.chunks[0].relevance_rank, 0);
        assert_eq!(out.chunks[0].candidate.rank, 1);
        assert!(out.degraded.is_none());
    }

    #[tokio::test]
    async fn unparseable_response_falls_back() {
        let out = reranker(Ok("I cannot rank these."))
            .rerank_detailed(candidates(4), "q", 3)
            .await;
        assert_eq!(ids(&out.chunks), vec!["c1", "c2", "c3"]);
        assert_eq!(out.degraded, Some(RerankDegraded::Unparseable));
    }

    #[tokio::test]
    async fn all_out_of_range_falls_back() {
        let out = reranker(Ok("7, 8, 0"))
            .rerank(candidates(3), "q", 5)
            .await;
        assert_eq!(ids(&out), vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn service_error_falls_back() {
        let out = reranker(Err("502 bad gateway"))
            .rerank_detailed(candidates(3), "q", 2)
            .await;
        assert_eq!(ids(&out.chunks), vec!["c1", "c2"]);
        assert!(matches!(out.degraded, Some(RerankDegraded::ServiceError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back() {
        let reranker = Reranker::new(Arc::new(Hung), Duration::from_secs(120));
        let out = reranker.rerank_detailed(candidates(3), "q", 2).await;
        assert_eq!(ids(&out.chunks), vec!["c1", "c2"]);
        assert_eq!(out.degraded, Some(RerankDegraded::Timeout));
    }

    #[tokio::test]
    async fn empty_input_skips_the_model() {
        let reranker = Reranker::new(Arc::new(Hung), Duration::from_secs(120));
        assert!(reranker.rerank(Vec::new(), "q", 5).await.is_empty());
    }

    proptest! {
        #[test]
        fn parsed_indices_are_unique_and_in_bounds(response in ".{0,64}", count in 0usize..12) {
            let parsed = parse_rerank_indices(&response, count);
            let mut sorted = parsed.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), parsed.len());
            prop_assert!(parsed.iter().all(|idx| *idx < count));
        }
    }
}
