use async_trait::async_trait;
use std::sync::Arc;

/// Parsed document content
pub struct ParsedDocument {
    pub content: String,
    pub file_type: String,
}

fn extension(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Parse raw document bytes into plain text
pub fn parse_bytes(file_name: &str, bytes: &[u8]) -> Result<ParsedDocument, String> {
    let ext = extension(file_name);

    match ext.as_str() {
        "txt" | "csv" => {
            let content = String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())?;
            Ok(ParsedDocument {
                content,
                file_type: ext,
            })
        }
        "md" | "markdown" => {
            let content = String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())?;
            Ok(ParsedDocument {
                content,
                file_type: "md".into(),
            })
        }
        "pdf" => {
            let content = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| format!("PDF parse error: {}", e))?;
            Ok(ParsedDocument {
                content,
                file_type: "pdf".into(),
            })
        }
        _ => Err(format!("Unsupported file type: .{}", ext)),
    }
}

/// Turns document bytes into text. `None` means nothing usable could be
/// extracted (scanned PDFs, unsupported formats).
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, file_name: &str, bytes: Arc<Vec<u8>>) -> Option<String>;
}

/// Extractor backed by [`parse_bytes`], run off the async executor.
#[derive(Debug, Default, Clone)]
pub struct FileTextExtractor;

#[async_trait]
impl TextExtractor for FileTextExtractor {
    async fn extract(&self, file_name: &str, bytes: Arc<Vec<u8>>) -> Option<String> {
        let name = file_name.to_string();
        // pdf-extract can panic on malformed input; the join error contains it.
        let parsed = tokio::task::spawn_blocking(move || parse_bytes(&name, &bytes)).await;

        match parsed {
            Ok(Ok(doc)) => {
                tracing::debug!(file_name, file_type = %doc.file_type, chars = doc.content.len(), "document text extracted");
                Some(doc.content)
            }
            Ok(Err(e)) => {
                tracing::warn!(file_name, error = %e, "text extraction failed");
                None
            }
            Err(e) => {
                tracing::warn!(file_name, error = %e, "text extraction aborted");
                None
            }
        }
    }
}

/// Collapse whitespace runs into single spaces and strip NUL bytes
pub fn collapse_whitespace(text: &str) -> String {
    text.replace('\0', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A window of document text, tagged with its position in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Lazy sequence of overlapping windows produced by [`segment`].
///
/// Cloning a `Segments` (before or after iterating) yields an independent
/// sequence starting at the same position, so callers can restart it.
#[derive(Debug, Clone)]
pub struct Segments {
    chars: Arc<[char]>,
    chunk_size: usize,
    step: usize,
    max_chunks: usize,
    start: usize,
    next_index: usize,
}

impl Iterator for Segments {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next_index >= self.max_chunks || self.start >= self.chars.len() {
            return None;
        }

        let end = (self.start + self.chunk_size).min(self.chars.len());
        let chunk = Chunk {
            index: self.next_index,
            text: self.chars[self.start..end].iter().collect(),
        };

        self.next_index += 1;
        if end >= self.chars.len() {
            self.start = self.chars.len();
        } else {
            self.start += self.step;
        }

        Some(chunk)
    }
}

/// Split text into overlapping windows of `chunk_size` characters.
///
/// Windows advance by `chunk_size - overlap`; at most `max_chunks` are
/// produced and any remaining text is dropped. `overlap` must be smaller
/// than `chunk_size`.
pub fn segment(text: &str, chunk_size: usize, overlap: usize, max_chunks: usize) -> Segments {
    let collapsed = collapse_whitespace(text);
    let chars: Arc<[char]> = if chunk_size == 0 {
        Arc::from(Vec::new())
    } else {
        collapsed.chars().collect::<Vec<_>>().into()
    };

    Segments {
        chars,
        chunk_size,
        step: chunk_size.saturating_sub(overlap).max(1),
        max_chunks,
        start: 0,
        next_index: 0,
    }
}
