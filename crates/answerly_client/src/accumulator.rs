//! The current answer: citation list plus streamed answer text.

use crate::messages::Citation;

/// Owns the mutable answer state for one query cycle.
///
/// The only ways to change it are [`reset_for_new_query`](Self::reset_for_new_query),
/// [`replace_citations`](Self::replace_citations) and [`append_text`](Self::append_text).
/// Citations and text are always cleared together.
#[derive(Debug, Default, Clone)]
pub struct ResponseAccumulator {
    citations: Vec<Citation>,
    answer_text: String,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_for_new_query(&mut self) {
        self.citations = Vec::new();
        self.answer_text = String::new();
    }

    /// Replace the citation list wholesale. Order is kept exactly as received.
    pub fn replace_citations(&mut self, citations: Vec<Citation>) {
        self.citations = citations;
    }

    /// Append a fragment with no separator or normalization.
    pub fn append_text(&mut self, fragment: &str) {
        self.answer_text.push_str(fragment);
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn answer_text(&self) -> &str {
        &self.answer_text
    }
}
