use std::time::Duration;

use thiserror::Error;

/// Failures of the retrieval stage. All of them end the current request.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector store error: {0}")]
    VectorStore(String),
}

#[derive(Error, Debug)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error("generation failed: {0}")]
    Generation(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn configuration(err: impl std::fmt::Display) -> Self {
        Self::Configuration(err.to_string())
    }

    pub(crate) fn generation_timeout(after: Duration) -> Self {
        Self::Generation(format!("timed out after {}s", after.as_secs_f32()))
    }

    /// Retrieval and generation failures surface to end users as one generic
    /// condition; this tells callers which bucket an error falls in.
    pub fn is_service_failure(&self) -> bool {
        matches!(self, RagError::Retrieval(_) | RagError::Generation(_))
    }
}

/// Failures while embedding and storing fragments.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("invalid fragment: {0}")]
    InvalidFragment(String),
    #[error("{kind} {id} already belongs to domain {existing}, not {requested}")]
    DomainConflict {
        kind: &'static str,
        id: String,
        existing: String,
        requested: String,
    },
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector store error: {0}")]
    Store(String),
}

impl IndexError {
    /// True when the upload itself is at fault rather than a backing service
    /// or the deployment's embedding configuration.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            IndexError::InvalidFragment(_) | IndexError::DomainConflict { .. }
        )
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Store(err.to_string())
    }
}

/// Why the reranker fell back to retrieval order. Logged, never returned as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerankDegraded {
    ServiceError(String),
    Timeout,
    Unparseable,
}

impl std::fmt::Display for RerankDegraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerankDegraded::ServiceError(msg) => write!(f, "service error: {msg}"),
            RerankDegraded::Timeout => write!(f, "timed out"),
            RerankDegraded::Unparseable => write!(f, "no usable chunk numbers in response"),
        }
    }
}
