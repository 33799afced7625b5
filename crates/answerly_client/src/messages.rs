//! WebSocket message types for the answer service. Client ↔ server JSON.
//!
//! Outbound there is a single shape, `{"query": "..."}`. Inbound frames are a
//! tagged envelope `{"type": ..., "data": ...}` with two known kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client → server: query message.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl<'a> QueryMessage<'a> {
    pub fn new(query: &'a str) -> Self {
        Self { query }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A retrieved source backing the answer. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub content: String,
}

/// One decoded server frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Full ordered citation list for the current query (replace-all).
    SearchResults(Vec<Citation>),
    /// Answer text fragment to append.
    Content(String),
}

/// A frame that could not be decoded. Always recoverable: the frame is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not JSON: {0}")]
    NotJson(String),
    #[error("missing type")]
    MissingType,
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("bad {kind} payload: {reason}")]
    BadPayload { kind: &'static str, reason: String },
}

#[derive(Deserialize)]
struct SearchResultsEnvelope {
    data: Vec<Citation>,
}

#[derive(Deserialize)]
struct ContentEnvelope {
    data: String,
}

impl ServerMessage {
    /// Decode one raw text frame.
    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        match typ {
            "search_results" => {
                let m: SearchResultsEnvelope =
                    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::BadPayload {
                        kind: "search_results",
                        reason: e.to_string(),
                    })?;
                Ok(ServerMessage::SearchResults(m.data))
            }
            "content" => {
                let m: ContentEnvelope =
                    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::BadPayload {
                        kind: "content",
                        reason: e.to_string(),
                    })?;
                Ok(ServerMessage::Content(m.data))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_message_has_single_field() {
        let json = QueryMessage::new("hello").to_json().unwrap();
        assert_eq!(json, r#"{"query":"hello"}"#);
    }

    #[test]
    fn decodes_search_results_in_order() {
        let frame = r#"{"type":"search_results","data":[
            {"title":"B","url":"http://b","content":"second"},
            {"title":"A","url":"http://a","content":"first"}
        ]}"#;
        let msg = ServerMessage::from_json(frame).unwrap();
        let ServerMessage::SearchResults(citations) = msg else {
            panic!("expected search results, got {msg:?}");
        };
        let titles: Vec<_> = citations.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["B", "A"]);
        assert_eq!(citations[1].content, "first");
    }

    #[test]
    fn decodes_content_fragment_verbatim() {
        let msg = ServerMessage::from_json(r#"{"type":"content","data":" there\n"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Content(" there\n".into()));
    }

    #[test]
    fn empty_citation_list_is_valid() {
        let msg = ServerMessage::from_json(r#"{"type":"search_results","data":[]}"#).unwrap();
        assert_eq!(msg, ServerMessage::SearchResults(Vec::new()));
    }

    #[test]
    fn plain_text_frame_is_rejected() {
        let err = ServerMessage::from_json("Query cannot be empty.").unwrap_err();
        assert!(matches!(err, ProtocolError::NotJson(_)));
    }

    #[test]
    fn unknown_and_missing_types_are_rejected() {
        assert_eq!(
            ServerMessage::from_json(r#"{"type":"done","data":null}"#),
            Err(ProtocolError::UnknownType("done".into()))
        );
        assert_eq!(
            ServerMessage::from_json(r#"{"data":"x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            ServerMessage::from_json(r#"{"type":7,"data":"x"}"#),
            Err(ProtocolError::MissingType)
        );
    }

    #[test]
    fn wrong_payload_shape_is_rejected() {
        let err = ServerMessage::from_json(r#"{"type":"content","data":["x"]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPayload { kind: "content", .. }));

        let err =
            ServerMessage::from_json(r#"{"type":"search_results","data":[{"title":"A"}]}"#)
                .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BadPayload {
                kind: "search_results",
                ..
            }
        ));
    }
}
