use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use knowhub_llm::GenerationService;
use tokio::time::timeout;
use tracing::debug;

use crate::confidence::UNKNOWN_SENTINEL;
use crate::error::{RagError, Result};
use crate::model::RankedChunk;

/// Context actually handed to the model, bounded by a character budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWindow {
    pub entries: Vec<String>,
    pub fragment_ids: Vec<String>,
    pub chars: usize,
}

impl ContextWindow {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    /// Every fragment id included in the context.
    pub cited_ids: Vec<String>,
    /// Context fragment ids that appear verbatim in the answer text.
    pub explicit_citations: Vec<String>,
}

/// Walks `chunks` in order, skipping repeated fragment ids, and stops at the
/// first entry that would push the total past `max_chars`.
pub fn assemble_context(chunks: &[RankedChunk], max_chars: usize) -> ContextWindow {
    let mut window = ContextWindow::default();
    let mut used = HashSet::new();
    for chunk in chunks {
        let fragment = chunk.fragment();
        if used.contains(fragment.id.as_str()) {
            continue;
        }
        let entry = format!(
            "Chunk {} (ID: {}): {}",
            window.entries.len() + 1,
            fragment.id,
            fragment.text
        );
        let len = entry.chars().count();
        if window.chars + len > max_chars {
            break;
        }
        used.insert(fragment.id.as_str());
        window.chars += len;
        window.fragment_ids.push(fragment.id.clone());
        window.entries.push(entry);
    }
    window
}

pub fn build_answer_prompt(context: &ContextWindow, question_text: &str) -> String {
    format!(
        "Context (with chunk IDs for citation):\n{}\n\nQuestion: {}\n\n\
         Instructions: Only answer using the context above. If the answer is present, cite the chunk ID \
         in the form (Chunk ID: <id>). If not, reply '{}' Do not make up information.\n\
         Answer:",
        context.render(),
        question_text.trim(),
        UNKNOWN_SENTINEL
    )
}

pub struct AnswerGenerator {
    llm: Arc<dyn GenerationService>,
    timeout: Duration,
}

impl AnswerGenerator {
    pub fn new(llm: Arc<dyn GenerationService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn generate(
        &self,
        ranked_chunks: &[RankedChunk],
        question_text: &str,
        max_context_chars: usize,
    ) -> Result<GeneratedAnswer> {
        let context = assemble_context(ranked_chunks, max_context_chars);
        if context.is_empty() {
            debug!(
                max_context_chars,
                "no chunk fits the context budget, answering unknown"
            );
            return Ok(GeneratedAnswer {
                text: UNKNOWN_SENTINEL.to_string(),
                cited_ids: Vec::new(),
                explicit_citations: Vec::new(),
            });
        }
        let prompt = build_answer_prompt(&context, question_text);
        let text = match timeout(self.timeout, self.llm.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => return Err(RagError::Generation(format!("{err:#}"))),
            Err(_) => return Err(RagError::generation_timeout(self.timeout)),
        };
        debug!(response = %text, context_chars = context.chars, "raw model answer");
        if text.trim().is_empty() {
            debug!("model returned a blank answer, answering unknown");
            return Ok(GeneratedAnswer {
                text: UNKNOWN_SENTINEL.to_string(),
                cited_ids: context.fragment_ids,
                explicit_citations: Vec::new(),
            });
        }
        let explicit_citations = context
            .fragment_ids
            .iter()
            .filter(|id| mentions(&text, id))
            .cloned()
            .collect();
        Ok(GeneratedAnswer {
            text,
            cited_ids: context.fragment_ids,
            explicit_citations,
        })
    }
}

/// True when `id` occurs in `text` as a whole token, so `c1` does not match
/// inside `c12`.
fn mentions(text: &str, id: &str) -> bool {
    let is_token_char = |c: char| c.is_alphanumeric() || c == '-' || c == '_';
    text.match_indices(id).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + id.len()..].chars().next();
        !before.is_some_and(is_token_char) && !after.is_some_and(is_token_char)
    })
}
