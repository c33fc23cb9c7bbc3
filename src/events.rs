use crate::db::models::Message;
use serde::Serialize;

/// One frame of the chat response stream.
///
/// Serializes to the frame's `data` payload; the variant picks the frame's
/// `event` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    /// The stored user message
    #[serde(rename_all = "camelCase")]
    Meta { user_message: Message },
    /// Next fragment of assistant output
    Delta { text: String },
    /// The stored assistant message; ends the stream
    #[serde(rename_all = "camelCase")]
    Done { assistant_message: Message },
    /// User-safe failure description; ends the stream
    Error { error: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize stream event");
            r#"{"error":"internal error"}"#.to_string()
        });
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}
