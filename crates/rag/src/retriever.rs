use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, error};

use crate::embedding::Embedder;
use crate::error::RetrievalError;
use crate::model::{Candidate, Fragment};
use crate::store::VectorStore;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, timeout: Duration) -> Self {
        Self {
            embedder,
            store,
            timeout,
        }
    }

    /// Embeds the question and returns up to `top_k` fragments from
    /// `domain_id`, closest first. An empty result is not an error.
    pub async fn retrieve(
        &self,
        question_text: &str,
        domain_id: &str,
        top_k: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let started = Instant::now();
        let vector = self.embed_question(question_text).await?;
        let neighbors = self
            .store
            .nearest_neighbors(&vector, domain_id, top_k)
            .await
            .map_err(|e| RetrievalError::VectorStore(format!("{e:#}")))?;
        let mut candidates = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            if neighbor.domain_id != domain_id {
                error!(
                    fragment = %neighbor.fragment_id,
                    expected = %domain_id,
                    found = %neighbor.domain_id,
                    "vector store returned a fragment from another domain"
                );
                continue;
            }
            candidates.push(Candidate {
                fragment: Fragment {
                    id: neighbor.fragment_id,
                    text: neighbor.text,
                    source_document_id: neighbor.document_id,
                    domain_id: neighbor.domain_id,
                },
                score: neighbor.distance,
                rank: 0,
            });
        }
        candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
        candidates.truncate(top_k);
        for (rank, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = rank;
        }
        debug!(
            domain = %domain_id,
            candidates = candidates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval finished"
        );
        Ok(candidates)
    }

    async fn embed_question(&self, question_text: &str) -> Result<Vec<f32>, RetrievalError> {
        let vector = match timeout(self.timeout, self.embedder.embed(question_text)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(err)) => return Err(RetrievalError::EmbeddingUnavailable(format!("{err:#}"))),
            Err(_) => {
                return Err(RetrievalError::EmbeddingUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f32()
                )))
            }
        };
        let expected = self.embedder.dimensions();
        if vector.len() != expected {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().all(|v| *v == 0.0) {
            return Err(RetrievalError::EmbeddingUnavailable(
                "embedding service returned a zero vector".to_string(),
            ));
        }
        Ok(vector)
    }
}
