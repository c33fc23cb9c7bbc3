use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid storage locator: {0}")]
    InvalidLocator(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of raw document bytes, addressed by an opaque locator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError>;
}

/// Documents kept on local disk under a single root directory
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a locator, refusing anything that could leave the root.
    fn resolve(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(locator);
        let contained = !locator.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
