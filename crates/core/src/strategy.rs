//! The self-modifying strategy document that steers an agent.
//!
//! Loaded once at start, edited in place through a single writer, persisted on
//! checkpoint. Concurrent delegation flows may read it freely but every edit
//! goes through the one `StrategyWriter` at a time.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Key-value blob persistence.
pub trait BlobStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn store(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key under a directory.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(CoreError::BlobStore(format!("invalid blob key: {:?}", key)));
        }
        Ok(self.dir.join(key))
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        // Readers never observe a partially written document.
        let tmp = self.dir.join(format!(".{}.tmp", key));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

struct StrategyState {
    content: String,
    revision: u64,
    persisted_revision: u64,
}

/// Process-wide strategy document.
pub struct StrategyDocument {
    store: Arc<dyn BlobStore>,
    key: String,
    state: Arc<RwLock<StrategyState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl StrategyDocument {
    /// Read the persisted document, or start empty when none exists.
    pub fn load(store: Arc<dyn BlobStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let content = store.load(&key)?.unwrap_or_default();
        info!("Loaded strategy document {} ({} bytes)", key, content.len());

        Ok(Self {
            store,
            key,
            state: Arc::new(RwLock::new(StrategyState {
                content,
                revision: 0,
                persisted_revision: 0,
            })),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Snapshot of the current content.
    pub fn read(&self) -> String {
        self.state.read().content.clone()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        state.revision != state.persisted_revision
    }

    /// Wait for exclusive edit rights.
    pub async fn writer(&self) -> StrategyWriter {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        StrategyWriter {
            state: Arc::clone(&self.state),
            _guard: guard,
        }
    }

    /// Persist the document if it changed since the last checkpoint.
    pub fn checkpoint(&self) -> Result<bool> {
        let (content, revision) = {
            let state = self.state.read();
            if state.revision == state.persisted_revision {
                return Ok(false);
            }
            (state.content.clone(), state.revision)
        };

        self.store.store(&self.key, &content)?;
        let mut state = self.state.write();
        state.persisted_revision = state.persisted_revision.max(revision);
        debug!("Checkpointed strategy {} at revision {}", self.key, revision);
        Ok(true)
    }
}

/// Exclusive edit handle; dropping it lets the next writer in.
pub struct StrategyWriter {
    state: Arc<RwLock<StrategyState>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl StrategyWriter {
    pub fn replace(&mut self, content: impl Into<String>) {
        let mut state = self.state.write();
        state.content = content.into();
        state.revision += 1;
    }

    pub fn append(&mut self, text: &str) {
        let mut state = self.state.write();
        if !state.content.is_empty() && !state.content.ends_with('\n') {
            state.content.push('\n');
        }
        state.content.push_str(text);
        state.revision += 1;
    }

    pub fn content(&self) -> String {
        self.state.read().content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[tokio::test]
    async fn test_load_edit_checkpoint() {
        let store = Arc::new(MemoryBlobStore::new());
        store.store("meta", "be subtle").unwrap();

        let doc = StrategyDocument::load(store.clone(), "meta").unwrap();
        assert_eq!(doc.read(), "be subtle");
        assert!(!doc.is_dirty());

        {
            let mut writer = doc.writer().await;
            writer.append("lead firmly when needed");
        }
        assert!(doc.is_dirty());
        assert!(doc.checkpoint().unwrap());
        assert!(!doc.checkpoint().unwrap());

        assert_eq!(
            store.load("meta").unwrap().as_deref(),
            Some("be subtle\nlead firmly when needed")
        );
    }

    #[tokio::test]
    async fn test_single_writer() {
        let doc = Arc::new(
            StrategyDocument::load(Arc::new(MemoryBlobStore::new()), "meta").unwrap(),
        );

        let first = doc.writer().await;
        let doc2 = Arc::clone(&doc);
        let second = tokio::spawn(async move {
            let mut writer = doc2.writer().await;
            writer.append("second");
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(first);
        second.await.unwrap();
        assert_eq!(doc.read(), "second");
    }

    #[test]
    fn test_file_store_round_trip() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("moltlink-blob-{}", nanos));
        let store = FileBlobStore::new(&dir);

        assert_eq!(store.load("meta").unwrap(), None);
        store.store("meta", "v1").unwrap();
        assert_eq!(store.load("meta").unwrap().as_deref(), Some("v1"));
        assert!(store.store("../escape", "x").is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
