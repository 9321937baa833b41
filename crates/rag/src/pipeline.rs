use std::sync::Arc;
use std::time::{Duration, Instant};

use knowhub_llm::{GenerationService, LlmClient, LlmProvider};
use tracing::{debug, info, info_span, Instrument};

use crate::confidence;
use crate::config::RagConfig;
use crate::embedding::{Embedder, EmbeddingClient};
use crate::error::{RagError, Result};
use crate::generator::{AnswerGenerator, GeneratedAnswer};
use crate::model::{AnswerResult, Candidate, Query, RankedChunk};
use crate::rerank::Reranker;
use crate::retriever::Retriever;
use crate::store::{RagStore, VectorStore};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// How many candidates retrieval fetches before reranking narrows them to `Query::top_k`.
    pub retrieve_k: usize,
    pub max_context_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retrieve_k: crate::config::DEFAULT_RETRIEVE_K,
            max_context_chars: crate::config::DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

/// One run of the answer pipeline. Stages only move forward.
enum Stage {
    Retrieve,
    Rerank(Vec<Candidate>),
    Generate(Vec<RankedChunk>),
    Estimate(GeneratedAnswer),
    Done(AnswerResult),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Retrieve => "retrieve",
            Stage::Rerank(_) => "rerank",
            Stage::Generate(_) => "generate",
            Stage::Estimate(_) => "estimate_confidence",
            Stage::Done(_) => "done",
        }
    }
}

pub struct RagPipeline {
    retriever: Retriever,
    reranker: Reranker,
    generator: AnswerGenerator,
    settings: PipelineSettings,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn GenerationService>,
        settings: PipelineSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            retriever: Retriever::new(embedder, store, timeout),
            reranker: Reranker::new(llm.clone(), timeout),
            generator: AnswerGenerator::new(llm, timeout),
            settings,
        }
    }

    /// Wires the real clients and the SQLite store from `config`. Missing
    /// endpoints or models fail here, before any request is served.
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        config.validate()?;
        let embedder = Arc::new(EmbeddingClient::from_config(config)?);
        let store = RagStore::open(&config.db_path, config.embedding_dimensions)
            .map_err(RagError::configuration)?;
        let llm = build_llm(config)?;
        Ok(Self::new(
            embedder,
            Arc::new(store),
            Arc::new(llm),
            PipelineSettings {
                retrieve_k: config.retrieve_k,
                max_context_chars: config.max_context_chars,
            },
            config.timeout,
        ))
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub async fn answer(&self, query: &Query) -> Result<AnswerResult> {
        validate_query(query)?;
        let span = info_span!("rag_pipeline", domain = %query.domain_id, top_k = query.top_k);
        self.run(query).instrument(span).await
    }

    async fn run(&self, query: &Query) -> Result<AnswerResult> {
        let started = Instant::now();
        let mut stage = Stage::Retrieve;
        loop {
            debug!(stage = stage.name(), "entering stage");
            stage = match stage {
                Stage::Retrieve => {
                    let fan_out = self.settings.retrieve_k.max(query.top_k);
                    let candidates = self
                        .retriever
                        .retrieve(&query.question_text, &query.domain_id, fan_out)
                        .await?;
                    if candidates.is_empty() {
                        info!("no candidates in domain, skipping generation");
                        Stage::Done(AnswerResult::no_relevant_documents())
                    } else {
                        Stage::Rerank(candidates)
                    }
                }
                Stage::Rerank(candidates) => {
                    let output = self
                        .reranker
                        .rerank_detailed(candidates, &query.question_text, query.top_k)
                        .await;
                    if let Some(reason) = &output.degraded {
                        debug!(reason = %reason, "continuing with retrieval order");
                    }
                    Stage::Generate(output.chunks)
                }
                Stage::Generate(chunks) => {
                    let answer = self
                        .generator
                        .generate(&chunks, &query.question_text, self.settings.max_context_chars)
                        .await?;
                    Stage::Estimate(answer)
                }
                Stage::Estimate(answer) => {
                    let confidence = confidence::estimate(&answer.text);
                    Stage::Done(AnswerResult {
                        text: answer.text,
                        confidence,
                        citations: answer.cited_ids,
                        explicit_citations: answer.explicit_citations,
                    })
                }
                Stage::Done(result) => {
                    info!(
                        confidence = result.confidence,
                        citations = result.citations.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "answer ready"
                    );
                    return Ok(result);
                }
            };
        }
    }
}

fn validate_query(query: &Query) -> Result<()> {
    if query.question_text.trim().is_empty() {
        return Err(RagError::InvalidQuery("question text is empty"));
    }
    if query.domain_id.trim().is_empty() {
        return Err(RagError::InvalidQuery("domain id is empty"));
    }
    if query.top_k == 0 {
        return Err(RagError::InvalidQuery("top_k must be positive"));
    }
    Ok(())
}

fn build_llm(config: &RagConfig) -> Result<LlmClient> {
    let client = match config.provider {
        LlmProvider::Ollama => {
            let base_url = config.ollama_base_url.as_deref().unwrap_or_default();
            let model = config.model.as_deref().unwrap_or_default();
            LlmClient::ollama(base_url, model)
        }
        LlmProvider::OpenAi => {
            LlmClient::new(LlmProvider::OpenAi, config.model.clone().unwrap_or_default())
        }
        LlmProvider::Local => Ok(LlmClient::local()),
    };
    client
        .and_then(|c| c.with_timeout(config.timeout))
        .map_err(RagError::configuration)
}
