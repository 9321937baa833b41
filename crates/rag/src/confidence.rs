/// Phrase the answer prompt tells the model to use when context is insufficient.
pub const UNKNOWN_SENTINEL: &str = "I don't know.";

pub const GROUNDED_CONFIDENCE: f32 = 0.9;

/// Coarse trust gate: `0.0` for empty or "unknown" answers, otherwise a fixed
/// `0.9`. Not a calibrated probability.
pub fn estimate(answer_text: &str) -> f32 {
    if answer_text.trim().is_empty() || signals_unknown(answer_text) {
        0.0
    } else {
        GROUNDED_CONFIDENCE
    }
}

/// Matches the sentinel regardless of case, trailing period, or a typographic apostrophe.
pub fn signals_unknown(answer_text: &str) -> bool {
    answer_text
        .to_lowercase()
        .replace('\u{2019}', "'")
        .contains("i don't know")
}
