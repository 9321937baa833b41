pub mod config;
pub mod confidence;
pub mod embedding;
pub mod error;
pub mod escalation;
pub mod generator;
pub mod indexer;
pub mod model;
pub mod pipeline;
pub mod rerank;
pub mod retriever;
pub mod store;

pub use config::{EmbeddingProvider, RagConfig};
pub use embedding::{Embedder, EmbeddingBackend, EmbeddingClient, HashEmbedder};
pub use error::{IndexError, RagError, RerankDegraded, RetrievalError};
pub use escalation::{Escalation, EscalationPolicy, EscalationStatus, NewEscalation};
pub use generator::{AnswerGenerator, ContextWindow, GeneratedAnswer};
pub use indexer::{index_fragments, read_fragments_jsonl};
pub use model::{AnswerResult, Candidate, Fragment, Principal, Query, RankedChunk};
pub use pipeline::{PipelineSettings, RagPipeline};
pub use rerank::{RerankOutput, Reranker};
pub use retriever::Retriever;
pub use store::{FragmentInsert, Neighbor, RagStore, VectorStore};
pub use knowhub_llm::{GenerationService, LlmClient, LlmProvider, LlmRequest, LlmResponse};
