pub mod openai;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// One generation call: the assembled prompt plus an optional provider-side file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub instructions: String,
    pub input: String,
    pub file_id: Option<String>,
}

/// Incremental output text, ending when the provider signals completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Start a streaming generation. Only text increments are yielded.
    async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError>;

    /// Store a file with the provider and return its reference.
    async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, LlmError>;
}

/// Accumulates streamed increments into the text that gets persisted.
#[derive(Debug, Default)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Final text with `\n` line endings and no surrounding whitespace.
    pub fn finish(self) -> String {
        self.text
            .replace("\r\n", "\n")
            .replace('\r', "\n")
            .trim()
            .to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Generation failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_normalizes_and_trims() {
        let mut t = Transcript::default();
        for delta in ["\n  Olá", ",\r\nsegunda", " linha\rterceira  ", "\r\n"] {
            t.push(delta);
        }
        assert_eq!(t.finish(), "Olá,\nsegunda linha\nterceira");
    }

    #[test]
    fn test_transcript_whitespace_only_is_empty() {
        let mut t = Transcript::default();
        t.push(" \r\n ");
        assert!(t.finish().is_empty());
    }
}
