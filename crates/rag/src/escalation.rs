use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_ESCALATION_THRESHOLD;
use crate::model::{AnswerResult, Principal, Query};

/// Caller-side rule turning a low-confidence answer into a human review.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EscalationPolicy {
    pub threshold: f32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }
}

impl EscalationPolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn should_escalate(&self, result: &AnswerResult) -> bool {
        result.confidence < self.threshold
    }

    /// The review record to persist for `result`, if it falls below the threshold.
    pub fn escalation_for(
        &self,
        query: &Query,
        result: &AnswerResult,
        principal: Option<&Principal>,
    ) -> Option<NewEscalation> {
        if !self.should_escalate(result) {
            return None;
        }
        Some(NewEscalation {
            question_text: query.question_text.clone(),
            domain_id: query.domain_id.clone(),
            subject_id: principal.map(|p| p.subject_id.clone()),
            answer_text: result.text.clone(),
            confidence: result.confidence,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationStatus {
    Pending,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "Pending",
            EscalationStatus::Resolved => "Resolved",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(EscalationStatus::Pending),
            "resolved" => Some(EscalationStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEscalation {
    pub question_text: String,
    pub domain_id: String,
    pub subject_id: Option<String>,
    pub answer_text: String,
    pub confidence: f32,
}

/// A low-confidence answer waiting for, or closed by, human review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Escalation {
    pub id: i64,
    pub question_text: String,
    pub domain_id: String,
    pub subject_id: Option<String>,
    pub answer_text: String,
    pub confidence: f32,
    pub status: EscalationStatus,
    pub created_at: String,
}
