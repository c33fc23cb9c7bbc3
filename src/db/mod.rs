pub mod models;

use async_trait::async_trait;
use models::{AttachedDocument, Conversation, Message, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Row-level reads and inserts the chat pipeline needs from persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    /// Up to `limit` most recent messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Most recently attached document of a conversation owned by `owner_id`.
    async fn active_document(
        &self,
        conversation_id: &str,
        owner_id: &str,
    ) -> Result<Option<AttachedDocument>, StoreError>;

    async fn set_document_file_id(&self, document_id: &str, file_id: &str)
        -> Result<(), StoreError>;
}

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Handle to the SQLite connection. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok();
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a synchronous query on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(&format!(
            "
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT ({now}),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                openai_file_id TEXT,
                created_at TEXT NOT NULL DEFAULT ({now}),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            ",
            now = NOW
        ))?;
        Ok(())
    }

    // ── Conversations ──

    pub fn create_conversation(
        &self,
        owner_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO conversations (id, owner_id, title) VALUES (?1, ?2, ?3)",
            params![id, owner_id, title],
        )?;
        let conv = conn.query_row(
            "SELECT id, owner_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            conversation_from_row,
        )?;
        Ok(conv)
    }

    pub fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn()?;
        let conv = conn
            .query_row(
                "SELECT id, owner_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conv)
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE conversations SET title = ?1, updated_at = {NOW} WHERE id = ?2"),
            params![title, id],
        )?;
        Ok(())
    }

    // ── Messages ──

    pub fn insert_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content) VALUES (?1, ?2, ?3, ?4)",
            params![id, conversation_id, role, content],
        )?;
        // Touch conversation updated_at
        conn.execute(
            &format!("UPDATE conversations SET updated_at = {NOW} WHERE id = ?1"),
            params![conversation_id],
        )?;
        let msg = conn.query_row(
            "SELECT id, conversation_id, role, content, created_at FROM messages WHERE id = ?1",
            params![id],
            message_from_row,
        )?;
        Ok(msg)
    }

    pub fn last_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], message_from_row)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    // ── Documents ──

    pub fn add_document(
        &self,
        conversation_id: &str,
        file_name: &str,
        storage_path: &str,
    ) -> Result<AttachedDocument, StoreError> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO documents (id, conversation_id, file_name, storage_path) VALUES (?1, ?2, ?3, ?4)",
            params![id, conversation_id, file_name, storage_path],
        )?;
        let doc = conn.query_row(
            "SELECT id, conversation_id, file_name, storage_path, openai_file_id, created_at
             FROM documents WHERE id = ?1",
            params![id],
            document_from_row,
        )?;
        Ok(doc)
    }

    pub fn latest_document(
        &self,
        conversation_id: &str,
        owner_id: &str,
    ) -> Result<Option<AttachedDocument>, StoreError> {
        let conn = self.conn()?;
        let doc = conn
            .query_row(
                "SELECT d.id, d.conversation_id, d.file_name, d.storage_path, d.openai_file_id, d.created_at
                 FROM documents d
                 JOIN conversations c ON c.id = d.conversation_id
                 WHERE d.conversation_id = ?1 AND c.owner_id = ?2
                 ORDER BY d.created_at DESC, d.rowid DESC
                 LIMIT 1",
                params![conversation_id, owner_id],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn update_document_file_id(
        &self,
        document_id: &str,
        file_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE documents SET openai_file_id = ?1 WHERE id = ?2",
            params![file_id, document_id],
        )?;
        Ok(())
    }
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<AttachedDocument> {
    Ok(AttachedDocument {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        file_name: row.get(2)?,
        storage_path: row.get(3)?,
        openai_file_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[async_trait]
impl ChatStore for Database {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let id = id.to_string();
        self.blocking(move |db| db.find_conversation(&id)).await
    }

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let (id, title) = (id.to_string(), title.to_string());
        self.blocking(move |db| db.update_conversation_title(&id, &title))
            .await
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |db| db.last_messages(&conversation_id, limit))
            .await
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let (conversation_id, content) = (conversation_id.to_string(), content.to_string());
        self.blocking(move |db| db.insert_message(&conversation_id, role, &content))
            .await
    }

    async fn active_document(
        &self,
        conversation_id: &str,
        owner_id: &str,
    ) -> Result<Option<AttachedDocument>, StoreError> {
        let (conversation_id, owner_id) = (conversation_id.to_string(), owner_id.to_string());
        self.blocking(move |db| db.latest_document(&conversation_id, &owner_id))
            .await
    }

    async fn set_document_file_id(
        &self,
        document_id: &str,
        file_id: &str,
    ) -> Result<(), StoreError> {
        let (document_id, file_id) = (document_id.to_string(), file_id.to_string());
        self.blocking(move |db| db.update_document_file_id(&document_id, &file_id))
            .await
    }
}
