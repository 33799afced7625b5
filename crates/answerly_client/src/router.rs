//! Decodes inbound frames and hands them to the accumulator.

use crate::accumulator::ResponseAccumulator;
use crate::messages::{ProtocolError, ServerMessage};

/// What a successfully routed frame did to the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Citations,
    /// Answer text arrived; the query is now streaming.
    Text,
}

/// Decode `frame` and apply it to `accumulator`.
///
/// A malformed frame leaves the accumulator untouched and is reported back
/// so the caller can log and drop it.
pub fn route(frame: &str, accumulator: &mut ResponseAccumulator) -> Result<Routed, ProtocolError> {
    match ServerMessage::from_json(frame)? {
        ServerMessage::SearchResults(citations) => {
            accumulator.replace_citations(citations);
            Ok(Routed::Citations)
        }
        ServerMessage::Content(fragment) => {
            accumulator.append_text(&fragment);
            Ok(Routed::Text)
        }
    }
}
