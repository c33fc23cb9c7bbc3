use crate::db::models::{AttachedDocument, Message, Role};
use crate::db::ChatStore;
use crate::doc_processor::Chunk;
use crate::llm::GenerationProvider;

pub const DEFAULT_INSTRUCTIONS: &str = "You are an assistant for municipal public administration. \
Help civil servants and citizens with procedures, deadlines, fees, permits and local legislation. \
Answer in the language of the question (usually Brazilian Portuguese), be accurate and concise, \
and cite the article or section you rely on when a document is provided. \
Never invent laws, deadlines or amounts.";

const HISTORY_HEADER: &str =
    "Previous messages in this conversation, for context only. Do not repeat them verbatim.";

const NOT_FOUND_RULE: &str = "Treat it as the primary source. Anything you cannot support with it \
must be explicitly marked as \"not found in the document\".";

/// Document material available to a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grounding {
    None,
    /// Extracted text, narrowed down to the chunks relevant to the question
    Excerpts { file_name: String, chunks: Vec<Chunk> },
    /// The raw file, already stored with the provider
    File { file_name: String, file_id: String },
}

impl Grounding {
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Grounding::File { file_id, .. } => Some(file_id.as_str()),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Grounding::None => "none",
            Grounding::Excerpts { .. } => "excerpts",
            Grounding::File { .. } => "file",
        }
    }
}

/// Text input and attachment for one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPayload {
    pub input: String,
    pub file_id: Option<String>,
}

/// Pick the model for a turn: the raw file needs the stronger model.
pub fn choose_model<'a>(has_file: bool, grounded_model: &'a str, text_model: &'a str) -> &'a str {
    if has_file {
        grounded_model
    } else {
        text_model
    }
}

/// Keep the last `max_chars` characters of `text`
pub fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

fn render_grounding(grounding: &Grounding) -> Option<String> {
    match grounding {
        Grounding::None => None,
        Grounding::Excerpts { file_name, chunks } if !chunks.is_empty() => {
            let mut out = format!(
                "Excerpts from the document \"{}\" attached to this conversation. {}\n",
                file_name, NOT_FOUND_RULE
            );
            for chunk in chunks {
                out.push_str(&format!("\n[excerpt {}]\n{}\n", chunk.index + 1, chunk.text));
            }
            Some(out)
        }
        Grounding::Excerpts { .. } => None,
        Grounding::File { file_name, .. } => Some(format!(
            "The document \"{}\" is attached to this message. {}\n",
            file_name, NOT_FOUND_RULE
        )),
    }
}

fn render_history(history: &[Message]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut out = format!("{}\n", HISTORY_HEADER);
    for message in history {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("{}: {}\n", speaker, message.content));
    }
    Some(out)
}

/// Build the prompt: grounding, then history (oldest first), then the
/// question. Over budget, the oldest text is cut so the question survives.
pub fn assemble(
    history: &[Message],
    grounding: &Grounding,
    question: &str,
    max_chars: usize,
) -> PromptPayload {
    let mut sections: Vec<String> = Vec::new();
    sections.extend(render_grounding(grounding));
    sections.extend(render_history(history));
    sections.push(format!("Current question:\n{}", question.trim()));

    PromptPayload {
        input: keep_tail(&sections.join("\n"), max_chars),
        file_id: grounding.file_id().map(str::to_string),
    }
}

/// Provider file reference for a document whose text could not be used.
///
/// Reuses the reference cached on the document row; otherwise uploads
/// `bytes` once and caches the result. `None` means the turn goes on
/// without grounding.
pub async fn file_fallback(
    store: &dyn ChatStore,
    provider: &dyn GenerationProvider,
    document: &AttachedDocument,
    bytes: Option<Vec<u8>>,
) -> Option<String> {
    if let Some(file_id) = &document.openai_file_id {
        return Some(file_id.clone());
    }

    let bytes = bytes?;
    let file_id = match provider.upload_file(&document.file_name, bytes).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(document_id = %document.id, error = %e, "document upload failed, continuing ungrounded");
            return None;
        }
    };

    if let Err(e) = store.set_document_file_id(&document.id, &file_id).await {
        // The reference still works for this turn; the next one uploads again.
        tracing::warn!(document_id = %document.id, error = %e, "could not cache provider file id");
    }
    tracing::info!(document_id = %document.id, %file_id, "document uploaded to provider");

    Some(file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            id: format!("m-{content}"),
            conversation_id: "c".into(),
            role,
            content: content.into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn test_assemble_orders_grounding_history_question() {
        let grounding = Grounding::Excerpts {
            file_name: "decreto.pdf".into(),
            chunks: vec![Chunk {
                index: 2,
                text: "prazo de 30 dias".into(),
            }],
        };
        let history = vec![msg(Role::User, "oi"), msg(Role::Assistant, "olá!")];
        let payload = assemble(&history, &grounding, "  qual o prazo? ", 10_000);

        let input = &payload.input;
        let doc_at = input.find("[excerpt 3]\nprazo de 30 dias").unwrap();
        let hist_at = input.find("User: oi\nAssistant: olá!").unwrap();
        let q_at = input.find("Current question:\nqual o prazo?").unwrap();
        assert!(doc_at < hist_at && hist_at < q_at);
        assert!(input.contains("not found in the document"));
        assert!(input.contains("Do not repeat them verbatim"));
        assert!(payload.file_id.is_none());
    }

    #[test]
    fn test_assemble_without_grounding_or_history() {
        let payload = assemble(&[], &Grounding::None, "Como pedir alvará?", 10_000);
        assert_eq!(payload.input, "Current question:\nComo pedir alvará?");
    }

    #[test]
    fn test_assemble_keeps_question_when_over_budget() {
        let history: Vec<_> = (0..50)
            .map(|i| msg(Role::User, &format!("mensagem antiga número {i}")))
            .collect();
        let payload = assemble(&history, &Grounding::None, "pergunta nova", 80);
        assert_eq!(payload.input.chars().count(), 80);
        assert!(payload.input.ends_with("Current question:\npergunta nova"));
        assert!(!payload.input.contains("número 0\n"));
    }

    #[test]
    fn test_assemble_with_file_reference() {
        let grounding = Grounding::File {
            file_name: "scan.pdf".into(),
            file_id: "file-9".into(),
        };
        let payload = assemble(&[], &grounding, "resuma", 1000);
        assert_eq!(payload.file_id.as_deref(), Some("file-9"));
        assert!(payload.input.starts_with("The document \"scan.pdf\" is attached"));
    }

    #[test]
    fn test_choose_model() {
        assert_eq!(choose_model(true, "big", "small"), "big");
        assert_eq!(choose_model(false, "big", "small"), "small");
    }

    #[test]
    fn test_keep_tail_counts_chars() {
        assert_eq!(keep_tail("ação", 2), "ão");
        assert_eq!(keep_tail("abc", 10), "abc");
    }
}
