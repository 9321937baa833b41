use serde::{Deserialize, Serialize};

/// A span of source-document text as it was indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub text: String,
    pub source_document_id: String,
    pub domain_id: String,
}

/// A fragment as returned by retrieval. `score` is the L2 distance to the
/// question vector (lower is closer); `rank` is its 0-based position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub fragment: Fragment,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub candidate: Candidate,
    pub relevance_rank: usize,
}

impl RankedChunk {
    pub fn fragment(&self) -> &Fragment {
        &self.candidate.fragment
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub text: String,
    pub confidence: f32,
    /// Every fragment id supplied to the generator as context, in context order.
    pub citations: Vec<String>,
    /// The subset of `citations` the model mentioned in its answer.
    #[serde(default)]
    pub explicit_citations: Vec<String>,
}

pub const NO_RELEVANT_DOCUMENTS: &str = "No relevant documents found.";

impl AnswerResult {
    pub fn no_relevant_documents() -> Self {
        Self {
            text: NO_RELEVANT_DOCUMENTS.to_string(),
            confidence: 0.0,
            citations: Vec::new(),
            explicit_citations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub question_text: String,
    pub domain_id: String,
    pub top_k: usize,
}

impl Query {
    pub fn new(question_text: impl Into<String>, domain_id: impl Into<String>, top_k: usize) -> Self {
        Self {
            question_text: question_text.into(),
            domain_id: domain_id.into(),
            top_k,
        }
    }
}

/// Identity of whoever asked, produced once by authentication. The pipeline
/// never sees it; calling layers carry it next to the [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject_id: String,
    pub role_id: Option<String>,
}
