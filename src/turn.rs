//! One chat turn: from the raw request to the stored assistant reply.
//!
//! [`prepare`] covers everything that can fail before the response starts
//! (request shape, caller identity, conversation ownership) and has no side
//! effects. [`run`] does the rest and reports through [`StreamEvent`]s.

use crate::auth::{AuthContext, AuthError, Authenticator};
use crate::config::RetrievalConfig;
use crate::context::{self, Grounding};
use crate::db::models::{Conversation, Message, Role};
use crate::db::{ChatStore, StoreError};
use crate::doc_processor::{collapse_whitespace, segment, Chunk, TextExtractor};
use crate::events::StreamEvent;
use crate::llm::{GenerationProvider, GenerationRequest, Transcript};
use crate::retrieval;
use crate::storage::DocumentStore;
use axum::http::{HeaderMap, StatusCode};
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const TITLE_MAX_CHARS: usize = 60;

/// Fixed operational settings of the turn pipeline
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub retrieval: RetrievalConfig,
    pub grounded_model: String,
    pub text_model: String,
    pub instructions: String,
    pub generation_timeout: Duration,
}

/// Collaborators shared by every turn, built once at startup
pub struct ChatServices {
    pub store: Arc<dyn ChatStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub provider: Arc<dyn GenerationProvider>,
    pub auth: Arc<dyn Authenticator>,
    pub settings: TurnSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Validating,
    Authenticating,
    Authorizing,
    LoadingHistory,
    ResolvingDocument,
    Streaming,
    Persisting,
    Completed,
    Errored,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Validating => "validating",
            TurnState::Authenticating => "authenticating",
            TurnState::Authorizing => "authorizing",
            TurnState::LoadingHistory => "loading_history",
            TurnState::ResolvingDocument => "resolving_document",
            TurnState::Streaming => "streaming",
            TurnState::Persisting => "persisting",
            TurnState::Completed => "completed",
            TurnState::Errored => "errored",
        };
        f.write_str(name)
    }
}

fn transition(state: &mut TurnState, next: TurnState) {
    tracing::debug!(from = %state, to = %next, "turn state");
    *state = next;
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("conversation belongs to another user")]
    Forbidden,
    #[error("could not load conversation data: {0}")]
    Load(StoreError),
    #[error("could not store user message: {0}")]
    UserMessageNotSaved(StoreError),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("could not store assistant message: {0}")]
    AssistantMessageNotSaved(StoreError),
    #[error("client disconnected")]
    Disconnected,
}

impl TurnError {
    pub fn status(&self) -> StatusCode {
        match self {
            TurnError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TurnError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            TurnError::ConversationNotFound => StatusCode::NOT_FOUND,
            TurnError::Forbidden => StatusCode::FORBIDDEN,
            TurnError::Generation(_) => StatusCode::BAD_GATEWAY,
            TurnError::Load(_)
            | TurnError::UserMessageNotSaved(_)
            | TurnError::AssistantMessageNotSaved(_)
            | TurnError::Disconnected => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to show the user; internal causes stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::BadRequest(reason) => reason.clone(),
            TurnError::Unauthenticated(_) => "Authentication required.".into(),
            TurnError::ConversationNotFound => "Conversation not found.".into(),
            TurnError::Forbidden => "You do not have access to this conversation.".into(),
            TurnError::Load(_) => "Could not load the conversation. Please try again.".into(),
            TurnError::UserMessageNotSaved(_) => {
                "Could not save your message. Please try again.".into()
            }
            TurnError::Generation(_) => "Could not obtain a response. Please try again.".into(),
            TurnError::AssistantMessageNotSaved(_) => {
                "The response could not be saved. Please try again.".into()
            }
            TurnError::Disconnected => "Connection closed.".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatTurnRequest {
    conversation_id: Option<String>,
    message: Option<String>,
}

/// A validated, authorized turn that has not touched storage yet
#[derive(Debug)]
pub struct PreparedTurn {
    pub caller: AuthContext,
    pub conversation: Conversation,
    pub question: String,
}

fn validate(body: &[u8]) -> Result<(String, String), TurnError> {
    let request: ChatTurnRequest = serde_json::from_slice(body)
        .map_err(|_| TurnError::BadRequest("Malformed request body.".into()))?;

    let conversation_id = request
        .conversation_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TurnError::BadRequest("conversationId is required.".into()))?;
    let message = request
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| TurnError::BadRequest("message is required.".into()))?;

    Ok((conversation_id, message))
}

/// Validate the request and resolve who is asking about which conversation.
pub async fn prepare(
    services: &ChatServices,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<PreparedTurn, TurnError> {
    let mut state = TurnState::Validating;
    let result = authorize(services, headers, body, &mut state).await;
    if let Err(e) = &result {
        tracing::info!(state = %state, error = %e, "turn rejected");
    }
    result
}

async fn authorize(
    services: &ChatServices,
    headers: &HeaderMap,
    body: &[u8],
    state: &mut TurnState,
) -> Result<PreparedTurn, TurnError> {
    let (conversation_id, question) = validate(body)?;

    transition(state, TurnState::Authenticating);
    let caller = services.auth.authenticate(headers)?;

    transition(state, TurnState::Authorizing);
    let conversation = services
        .store
        .get_conversation(&conversation_id)
        .await
        .map_err(TurnError::Load)?
        .ok_or(TurnError::ConversationNotFound)?;
    if conversation.owner_id != caller.user_id {
        return Err(TurnError::Forbidden);
    }

    Ok(PreparedTurn {
        caller,
        conversation,
        question,
    })
}

/// Drive a prepared turn to completion, reporting through `events`.
///
/// Exactly one terminal event (`done` or `error`) is sent unless the
/// receiver has gone away.
pub async fn run(services: &ChatServices, turn: PreparedTurn, events: &mpsc::Sender<StreamEvent>) {
    // prepare() already got the turn through authorization
    let mut state = TurnState::Authorizing;
    let started = Instant::now();

    match execute(services, &turn, events, &mut state).await {
        Ok(assistant_message) => {
            tracing::info!(
                conversation_id = %turn.conversation.id,
                user_id = %turn.caller.user_id,
                state = %TurnState::Completed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "turn completed"
            );
            let _ = events.send(StreamEvent::Done { assistant_message }).await;
        }
        Err(TurnError::Disconnected) => {
            tracing::info!(
                conversation_id = %turn.conversation.id,
                state = %state,
                "client disconnected, turn abandoned"
            );
        }
        Err(e) => {
            tracing::error!(
                conversation_id = %turn.conversation.id,
                user_id = %turn.caller.user_id,
                state = %state,
                next = %TurnState::Errored,
                error = %e,
                "turn failed"
            );
            let _ = events
                .send(StreamEvent::Error {
                    error: e.user_message(),
                })
                .await;
        }
    }
}

async fn execute(
    services: &ChatServices,
    turn: &PreparedTurn,
    events: &mpsc::Sender<StreamEvent>,
    state: &mut TurnState,
) -> Result<Message, TurnError> {
    let settings = &services.settings;
    let conversation = &turn.conversation;

    // 1. Load recent history (before this turn's message is stored)
    transition(state, TurnState::LoadingHistory);
    let history = services
        .store
        .recent_messages(&conversation.id, settings.retrieval.max_history_messages)
        .await
        .map_err(TurnError::Load)?;

    // 2. Ground in the active document, best effort
    transition(state, TurnState::ResolvingDocument);
    let grounding = resolve_grounding(services, turn).await;
    let payload = context::assemble(
        &history,
        &grounding,
        &turn.question,
        settings.retrieval.max_prompt_chars,
    );
    let model = context::choose_model(
        payload.file_id.is_some(),
        &settings.grounded_model,
        &settings.text_model,
    );
    tracing::debug!(
        conversation_id = %conversation.id,
        grounding = grounding.kind(),
        history = history.len(),
        prompt_chars = payload.input.chars().count(),
        model,
        "prompt assembled"
    );

    // 3. Store the user message before any provider call
    transition(state, TurnState::Streaming);
    let user_message = services
        .store
        .add_message(&conversation.id, Role::User, &turn.question)
        .await
        .map_err(TurnError::UserMessageNotSaved)?;
    infer_title(services.store.as_ref(), conversation, &turn.question).await;
    events
        .send(StreamEvent::Meta { user_message })
        .await
        .map_err(|_| TurnError::Disconnected)?;

    // 4. Stream the reply
    let request = GenerationRequest {
        model: model.to_string(),
        instructions: settings.instructions.clone(),
        input: payload.input,
        file_id: payload.file_id,
    };
    let text = relay(services, &request, events, settings.generation_timeout).await?;

    // 5. Store the assistant message
    transition(state, TurnState::Persisting);
    if text.is_empty() {
        return Err(TurnError::Generation("empty response".into()));
    }
    services
        .store
        .add_message(&conversation.id, Role::Assistant, &text)
        .await
        .map_err(TurnError::AssistantMessageNotSaved)
}

/// Forward provider increments as `delta` events; returns the final transcript.
async fn relay(
    services: &ChatServices,
    request: &GenerationRequest,
    events: &mpsc::Sender<StreamEvent>,
    timeout: Duration,
) -> Result<String, TurnError> {
    let deadline = Instant::now() + timeout;

    let started = tokio::select! {
        started = tokio::time::timeout_at(deadline, services.provider.stream(request)) => started,
        _ = events.closed() => return Err(TurnError::Disconnected),
    };
    let mut stream = started
        .map_err(|_| TurnError::Generation("timed out starting generation".into()))?
        .map_err(|e| TurnError::Generation(e.to_string()))?;

    let mut transcript = Transcript::default();
    loop {
        // A quiet provider must not keep the turn alive once the client is gone.
        let next = tokio::select! {
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
            _ = events.closed() => return Err(TurnError::Disconnected),
        };
        let next =
            next.map_err(|_| TurnError::Generation("timed out while streaming".into()))?;

        match next {
            Some(Ok(delta)) if delta.is_empty() => {}
            Some(Ok(delta)) => {
                transcript.push(&delta);
                events
                    .send(StreamEvent::Delta { text: delta })
                    .await
                    .map_err(|_| TurnError::Disconnected)?;
            }
            Some(Err(e)) => return Err(TurnError::Generation(e.to_string())),
            None => break,
        }
    }

    Ok(transcript.finish())
}

/// Document grounding for the turn. Never fails: every problem downgrades
/// to less grounding.
async fn resolve_grounding(services: &ChatServices, turn: &PreparedTurn) -> Grounding {
    let conversation_id = &turn.conversation.id;
    let document = match services
        .store
        .active_document(conversation_id, &turn.caller.user_id)
        .await
    {
        Ok(Some(document)) => document,
        Ok(None) => return Grounding::None,
        Err(e) => {
            tracing::warn!(%conversation_id, error = %e, "could not look up attached document");
            return Grounding::None;
        }
    };

    let bytes = match services.documents.fetch(&document.storage_path).await {
        Ok(bytes) => Some(Arc::new(bytes)),
        Err(e) => {
            tracing::warn!(document_id = %document.id, error = %e, "could not fetch document bytes");
            None
        }
    };

    if let Some(bytes) = &bytes {
        if let Some(text) = services
            .extractor
            .extract(&document.file_name, Arc::clone(bytes))
            .await
        {
            let retrieval = &services.settings.retrieval;
            let chunks: Vec<Chunk> = segment(
                &text,
                retrieval.chunk_size,
                retrieval.overlap,
                retrieval.max_chunks,
            )
            .collect();

            if !chunks.is_empty() {
                let selected =
                    retrieval::select(&chunks, &turn.question, &retrieval.selection_limits());
                tracing::debug!(
                    document_id = %document.id,
                    chunks = chunks.len(),
                    selected = selected.len(),
                    "document excerpts selected"
                );
                return Grounding::Excerpts {
                    file_name: document.file_name.clone(),
                    chunks: selected,
                };
            }
        }
        tracing::warn!(document_id = %document.id, "no usable text in document, falling back to file upload");
    }

    let bytes = bytes.map(|b| Arc::try_unwrap(b).unwrap_or_else(|shared| shared.as_ref().clone()));
    match context::file_fallback(
        services.store.as_ref(),
        services.provider.as_ref(),
        &document,
        bytes,
    )
    .await
    {
        Some(file_id) => Grounding::File {
            file_name: document.file_name.clone(),
            file_id,
        },
        None => Grounding::None,
    }
}

/// Title for an untitled conversation, taken from its first question
pub fn title_from(question: &str) -> String {
    let collapsed = collapse_whitespace(question);
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS - 1).collect();
    format!("{}…", cut.trim_end())
}

async fn infer_title(store: &dyn ChatStore, conversation: &Conversation, question: &str) {
    let untitled = conversation
        .title
        .as_deref()
        .map_or(true, |t| t.trim().is_empty());
    if !untitled {
        return;
    }
    if let Err(e) = store
        .set_conversation_title(&conversation.id, &title_from(question))
        .await
    {
        tracing::warn!(conversation_id = %conversation.id, error = %e, "could not set conversation title");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, NoAuth};
    use crate::db::models::AttachedDocument;
    use crate::db::Database;
    use crate::llm::{LlmError, TextStream};
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Script {
        Deltas(Vec<Result<&'static str, &'static str>>),
        Hang,
    }

    struct FakeProvider {
        script: Script,
        upload: Result<&'static str, &'static str>,
        uploads: AtomicUsize,
        requests: Mutex<Vec<GenerationRequest>>,
        /// Conversation whose stored user messages are counted at call time
        watch: Option<(Arc<Database>, String)>,
        user_rows_at_call: Mutex<Vec<usize>>,
    }

    impl FakeProvider {
        fn replying(deltas: Vec<Result<&'static str, &'static str>>) -> Self {
            Self {
                script: Script::Deltas(deltas),
                upload: Ok("file-xyz"),
                uploads: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                watch: None,
                user_rows_at_call: Mutex::new(Vec::new()),
            }
        }

        fn last_request(&self) -> GenerationRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl GenerationProvider for FakeProvider {
        async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some((db, conversation_id)) = &self.watch {
                let users = db
                    .last_messages(conversation_id, 100)
                    .unwrap()
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .count();
                self.user_rows_at_call.lock().unwrap().push(users);
            }
            match &self.script {
                Script::Deltas(deltas) => {
                    let items: Vec<Result<String, LlmError>> = deltas
                        .iter()
                        .map(|d| match d {
                            Ok(text) => Ok(text.to_string()),
                            Err(msg) => Err(LlmError::Failed(msg.to_string())),
                        })
                        .collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Script::Hang => Ok(Box::pin(futures::stream::pending())),
            }
        }

        async fn upload_file(&self, _file_name: &str, _bytes: Vec<u8>) -> Result<String, LlmError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.upload
                .map(str::to_string)
                .map_err(|msg| LlmError::Failed(msg.to_string()))
        }
    }

    struct FakeExtractor {
        text: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextExtractor for FakeExtractor {
        async fn extract(&self, _file_name: &str, _bytes: Arc<Vec<u8>>) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.text.clone()
        }
    }

    #[derive(Default)]
    struct MemoryDocuments(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl DocumentStore for MemoryDocuments {
        async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
            self.0
                .get(locator)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(locator.to_string()))
        }
    }

    /// Database wrapper that counts every write and can fail one message insert
    struct CountingStore {
        db: Arc<Database>,
        writes: AtomicUsize,
        adds: AtomicUsize,
        /// 1-based `add_message` call that fails
        fail_add_at: Option<usize>,
    }

    impl CountingStore {
        fn new(db: Arc<Database>, fail_add_at: Option<usize>) -> Self {
            Self {
                db,
                writes: AtomicUsize::new(0),
                adds: AtomicUsize::new(0),
                fail_add_at,
            }
        }
    }

    #[async_trait]
    impl ChatStore for CountingStore {
        async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
            self.db.get_conversation(id).await
        }

        async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.db.set_conversation_title(id, title).await
        }

        async fn recent_messages(
            &self,
            conversation_id: &str,
            limit: usize,
        ) -> Result<Vec<Message>, StoreError> {
            self.db.recent_messages(conversation_id, limit).await
        }

        async fn add_message(
            &self,
            conversation_id: &str,
            role: Role,
            content: &str,
        ) -> Result<Message, StoreError> {
            let call = self.adds.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_add_at == Some(call) {
                return Err(StoreError::Poisoned);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.db.add_message(conversation_id, role, content).await
        }

        async fn active_document(
            &self,
            conversation_id: &str,
            owner_id: &str,
        ) -> Result<Option<AttachedDocument>, StoreError> {
            self.db.active_document(conversation_id, owner_id).await
        }

        async fn set_document_file_id(
            &self,
            document_id: &str,
            file_id: &str,
        ) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.db.set_document_file_id(document_id, file_id).await
        }
    }

    fn settings() -> TurnSettings {
        TurnSettings {
            retrieval: RetrievalConfig {
                chunk_size: 120,
                overlap: 20,
                ..RetrievalConfig::default()
            },
            grounded_model: "grounded-model".into(),
            text_model: "text-model".into(),
            instructions: "be helpful".into(),
            generation_timeout: Duration::from_secs(5),
        }
    }

    fn services(
        store: Arc<dyn ChatStore>,
        provider: Arc<FakeProvider>,
        extractor: Arc<FakeExtractor>,
        documents: MemoryDocuments,
    ) -> ChatServices {
        ChatServices {
            store,
            documents: Arc::new(documents),
            extractor,
            provider,
            auth: Arc::new(NoAuth::new("maria")),
            settings: settings(),
        }
    }

    fn extractor(text: Option<&str>) -> Arc<FakeExtractor> {
        Arc::new(FakeExtractor {
            text: text.map(str::to_string),
            calls: AtomicUsize::new(0),
        })
    }

    fn body(conversation_id: &str, message: &str) -> Vec<u8> {
        json!({ "conversationId": conversation_id, "message": message })
            .to_string()
            .into_bytes()
    }

    async fn run_turn(
        services: &ChatServices,
        body: &[u8],
    ) -> Result<Vec<StreamEvent>, TurnError> {
        let turn = prepare(services, &HeaderMap::new(), body).await?;
        let (tx, mut rx) = mpsc::channel(64);
        run(services, turn, &tx).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        Ok(events)
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[tokio::test]
    async fn test_turn_without_document_streams_and_persists() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![
            Ok("Olá"),
            Ok(", "),
            Ok("tudo bem?\r\n"),
        ]));
        let extractor = extractor(Some("unused"));
        let services = services(
            db.clone(),
            provider.clone(),
            extractor.clone(),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "Bom dia")).await.unwrap();

        assert_eq!(names(&events), vec!["meta", "delta", "delta", "delta", "done"]);
        let StreamEvent::Done { assistant_message } = events.last().unwrap() else {
            panic!("expected done");
        };
        assert_eq!(assistant_message.content, "Olá, tudo bem?");
        assert_eq!(assistant_message.role, Role::Assistant);

        let stored = db.last_messages(&conv.id, 10).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "Bom dia");
        assert_eq!(stored[1].id, assistant_message.id);

        // grounding skipped entirely
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        let request = provider.last_request();
        assert_eq!(request.model, "text-model");
        assert_eq!(request.instructions, "be helpful");
        assert!(request.file_id.is_none());
        assert!(request.input.ends_with("Current question:\nBom dia"));
        assert!(!request.input.contains("document"));

        let conv = db.find_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(conv.title.as_deref(), Some("Bom dia"));
    }

    #[tokio::test]
    async fn test_user_message_is_stored_before_generation() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", Some("IPTU")).unwrap();
        let mut provider = FakeProvider::replying(vec![Ok("resposta")]);
        provider.watch = Some((db.clone(), conv.id.clone()));
        let provider = Arc::new(provider);
        let services = services(
            db.clone(),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        run_turn(&services, &body(&conv.id, "pergunta")).await.unwrap();

        assert_eq!(*provider.user_rows_at_call.lock().unwrap(), vec![1]);
        // existing titles are left alone
        let conv = db.find_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(conv.title.as_deref(), Some("IPTU"));
    }

    #[tokio::test]
    async fn test_history_is_included_oldest_first() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        db.insert_message(&conv.id, Role::User, "primeira pergunta").unwrap();
        db.insert_message(&conv.id, Role::Assistant, "primeira resposta").unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("ok")]));
        let services = services(
            db.clone(),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        run_turn(&services, &body(&conv.id, "segunda pergunta")).await.unwrap();

        let input = provider.last_request().input;
        let first = input.find("User: primeira pergunta").unwrap();
        let reply = input.find("Assistant: primeira resposta").unwrap();
        let current = input.find("Current question:\nsegunda pergunta").unwrap();
        assert!(first < reply && reply < current);
        assert!(!input.contains("User: segunda pergunta"));
    }

    #[tokio::test]
    async fn test_document_excerpt_grounds_the_prompt() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        db.add_document(&conv.id, "decreto.pdf", "c1/decreto.pdf").unwrap();

        let text = format!(
            "{} O contribuinte terá prazo de 30 dias para recorrer. {}",
            "Disposições gerais sobre tributos municipais. ".repeat(10),
            "Das penalidades e multas aplicáveis. ".repeat(10)
        );
        let mut docs = MemoryDocuments::default();
        docs.0.insert("c1/decreto.pdf".into(), b"%PDF".to_vec());
        let provider = Arc::new(FakeProvider::replying(vec![Ok("30 dias.")]));
        let services = services(db.clone(), provider.clone(), extractor(Some(&text)), docs);

        let events = run_turn(&services, &body(&conv.id, "qual o prazo?")).await.unwrap();

        assert_eq!(names(&events).last(), Some(&"done"));
        let request = provider.last_request();
        assert!(request.input.contains("prazo de 30 dias"));
        assert!(request.input.contains("decreto.pdf"));
        // the opening window never mentions the deadline
        assert!(!request.input.contains("[excerpt 1]\n"));
        assert!(request.file_id.is_none());
        assert_eq!(request.model, "text-model");
        assert_eq!(provider.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unextractable_document_uses_uploaded_file_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let doc = db.add_document(&conv.id, "scan.pdf", "c1/scan.pdf").unwrap();
        let mut docs = MemoryDocuments::default();
        docs.0.insert("c1/scan.pdf".into(), b"%PDF-image".to_vec());
        let provider = Arc::new(FakeProvider::replying(vec![Ok("Resumo do arquivo.")]));
        let services = services(db.clone(), provider.clone(), extractor(None), docs);

        let events = run_turn(&services, &body(&conv.id, "resuma o documento")).await.unwrap();
        assert_eq!(names(&events).last(), Some(&"done"));

        let request = provider.last_request();
        assert_eq!(request.file_id.as_deref(), Some("file-xyz"));
        assert_eq!(request.model, "grounded-model");
        assert!(request.input.contains("\"scan.pdf\" is attached"));
        let cached = db.latest_document(&conv.id, "maria").unwrap().unwrap();
        assert_eq!(cached.id, doc.id);
        assert_eq!(cached.openai_file_id.as_deref(), Some("file-xyz"));

        run_turn(&services, &body(&conv.id, "e o artigo 2?")).await.unwrap();
        assert_eq!(provider.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.last_request().file_id.as_deref(), Some("file-xyz"));
    }

    #[tokio::test]
    async fn test_failed_upload_continues_ungrounded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        db.add_document(&conv.id, "scan.pdf", "c1/scan.pdf").unwrap();
        let mut docs = MemoryDocuments::default();
        docs.0.insert("c1/scan.pdf".into(), b"%PDF-image".to_vec());
        let mut provider = FakeProvider::replying(vec![Ok("Sem documento.")]);
        provider.upload = Err("quota exceeded");
        let provider = Arc::new(provider);
        let services = services(db.clone(), provider.clone(), extractor(Some("   ")), docs);

        let events = run_turn(&services, &body(&conv.id, "o que diz?")).await.unwrap();

        assert_eq!(names(&events).last(), Some(&"done"));
        let request = provider.last_request();
        assert!(request.file_id.is_none());
        assert_eq!(request.model, "text-model");
        assert_eq!(provider.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_document_bytes_continue_ungrounded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        db.add_document(&conv.id, "sumiu.pdf", "c1/sumiu.pdf").unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("ok")]));
        let extractor = extractor(Some("texto"));
        let services = services(
            db.clone(),
            provider.clone(),
            extractor.clone(),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "pergunta")).await.unwrap();

        assert_eq!(names(&events).last(), Some(&"done"));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.uploads.load(Ordering::SeqCst), 0);
        assert!(provider.last_request().file_id.is_none());
    }

    #[tokio::test]
    async fn test_malformed_requests_have_no_side_effects() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let store = Arc::new(CountingStore::new(db.clone(), None));
        let provider = Arc::new(FakeProvider::replying(vec![Ok("nunca")]));
        let services = services(
            store.clone(),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        let bodies: Vec<Vec<u8>> = vec![
            b"{not json".to_vec(),
            json!({ "message": "oi" }).to_string().into_bytes(),
            body(&conv.id, "   "),
            body("", "oi"),
            json!({ "conversationId": 7, "message": "oi" }).to_string().into_bytes(),
        ];
        for b in bodies {
            let err = run_turn(&services, &b).await.unwrap_err();
            assert!(matches!(err, TurnError::BadRequest(_)), "{err}");
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }

        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_and_unknown_conversations_are_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let foreign = db.create_conversation("joao", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("nunca")]));
        let services = services(
            db.clone(),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        let err = run_turn(&services, &body(&foreign.id, "oi")).await.unwrap_err();
        assert!(matches!(err, TurnError::Forbidden));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = run_turn(&services, &body("does-not-exist", "oi")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        assert!(db.last_messages(&foreign.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("nunca")]));
        let mut services = services(
            db.clone(),
            provider,
            extractor(None),
            MemoryDocuments::default(),
        );
        services.auth = Arc::new(ApiKeyAuth::new(&["k1:maria".to_string()]));

        let err = run_turn(&services, &body(&conv.id, "oi")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.user_message(), "Authentication required.");
    }

    #[tokio::test]
    async fn test_empty_generation_reports_error_without_assistant_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![]));
        let services = services(
            db.clone(),
            provider,
            extractor(None),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "olá?")).await.unwrap();

        assert_eq!(names(&events), vec!["meta", "error"]);
        let StreamEvent::Error { error } = &events[1] else {
            panic!("expected error");
        };
        assert!(error.to_lowercase().contains("could not obtain a response"));

        let stored = db.last_messages(&conv.id, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_whitespace_only_generation_is_empty() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok(" \r\n "), Ok("\n")]));
        let services = services(
            db.clone(),
            provider,
            extractor(None),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "olá?")).await.unwrap();

        assert_eq!(names(&events).last(), Some(&"error"));
        assert_eq!(db.last_messages(&conv.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_persists_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![
            Ok("Começando"),
            Err("upstream reset"),
        ]));
        let services = services(
            db.clone(),
            provider,
            extractor(None),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "olá?")).await.unwrap();

        assert_eq!(names(&events), vec!["meta", "delta", "error"]);
        let StreamEvent::Error { error } = &events[2] else {
            panic!("expected error");
        };
        assert!(!error.contains("upstream reset"));
        assert_eq!(db.last_messages(&conv.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generation_timeout_is_a_generation_failure() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let mut provider = FakeProvider::replying(vec![]);
        provider.script = Script::Hang;
        let mut services = services(
            db.clone(),
            Arc::new(provider),
            extractor(None),
            MemoryDocuments::default(),
        );
        services.settings.generation_timeout = Duration::from_millis(50);

        let events = run_turn(&services, &body(&conv.id, "olá?")).await.unwrap();

        assert_eq!(names(&events), vec!["meta", "error"]);
        assert_eq!(db.last_messages(&conv.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_client_gets_no_assistant_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("ninguém ouve")]));
        let services = services(
            db.clone(),
            provider,
            extractor(None),
            MemoryDocuments::default(),
        );

        let turn = prepare(&services, &HeaderMap::new(), &body(&conv.id, "oi"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        run(&services, turn, &tx).await;

        let stored = db.last_messages(&conv.id, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_failed_user_insert_skips_generation() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("nunca")]));
        let services = services(
            Arc::new(CountingStore::new(db.clone(), Some(1))),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "oi")).await.unwrap();

        assert_eq!(names(&events), vec!["error"]);
        let StreamEvent::Error { error } = &events[0] else {
            panic!("expected error");
        };
        assert_eq!(error, "Could not save your message. Please try again.");
        assert!(provider.requests.lock().unwrap().is_empty());
        assert!(db.last_messages(&conv.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_assistant_insert_ends_with_error() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let provider = Arc::new(FakeProvider::replying(vec![Ok("Olá"), Ok(" mundo")]));
        let services = services(
            Arc::new(CountingStore::new(db.clone(), Some(2))),
            provider.clone(),
            extractor(None),
            MemoryDocuments::default(),
        );

        let events = run_turn(&services, &body(&conv.id, "oi")).await.unwrap();

        assert_eq!(names(&events), vec!["meta", "delta", "delta", "error"]);
        let StreamEvent::Error { error } = &events[3] else {
            panic!("expected error");
        };
        assert_eq!(error, "The response could not be saved. Please try again.");
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
        let stored = db.last_messages(&conv.id, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_disconnect_stops_a_quiet_generation() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conv = db.create_conversation("maria", None).unwrap();
        let mut provider = FakeProvider::replying(vec![]);
        provider.script = Script::Hang;
        let mut services = services(
            db.clone(),
            Arc::new(provider),
            extractor(None),
            MemoryDocuments::default(),
        );
        services.settings.generation_timeout = Duration::from_secs(60);

        let turn = prepare(&services, &HeaderMap::new(), &body(&conv.id, "oi"))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let client = async move {
            let first = rx.recv().await;
            drop(rx);
            first
        };

        let (_, first) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(run(&services, turn, &tx), client) },
        )
        .await
        .expect("turn kept running after the client went away");

        assert_eq!(first.as_ref().map(StreamEvent::name), Some("meta"));
        let stored = db.last_messages(&conv.id, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
    }

    #[test]
    fn test_transition_moves_to_next_state() {
        let mut state = TurnState::Authorizing;
        transition(&mut state, TurnState::LoadingHistory);
        assert_eq!(state, TurnState::LoadingHistory);
        assert_eq!(state.to_string(), "loading_history");
    }

    #[test]
    fn test_read_and_write_failures_have_distinct_messages() {
        let load = TurnError::Load(StoreError::Poisoned);
        let save = TurnError::UserMessageNotSaved(StoreError::Poisoned);
        assert_eq!(load.user_message(), "Could not load the conversation. Please try again.");
        assert_ne!(load.user_message(), save.user_message());
        assert_eq!(load.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_title_from_long_question() {
        assert_eq!(title_from("  Como   pedir\nalvará? "), "Como pedir alvará?");
        let long = "palavra ".repeat(20);
        let title = title_from(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with('…'));
    }
}
