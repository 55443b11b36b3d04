//! Persistent document store
//!
//! Named collections of JSON documents, persisted one file per collection
//! under the state directory. Writes are atomic (tmp + rename); a corrupted
//! collection file is backed up and replaced rather than aborting startup.
//! `in_memory()` builds a store with no backing files for tests.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A document store holding named collections of JSON documents.
pub struct DocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
    base_dir: PathBuf,
    auto_save: bool,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("base_dir", &self.base_dir)
            .field("auto_save", &self.auto_save)
            .finish()
    }
}

impl DocumentStore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub fn open(base_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            collections: RwLock::new(HashMap::new()),
            base_dir,
            auto_save: true,
        })
    }

    /// An in-memory only store (for testing).
    pub fn in_memory() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            base_dir: PathBuf::new(),
            auto_save: false,
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_dir.join(format!("{collection}.json"))
    }

    /// Load a collection from disk on first access.
    fn ensure_loaded(&self, collection: &str) {
        {
            let collections = self.collections.read();
            if collections.contains_key(collection) {
                return;
            }
        }
        let documents = if self.auto_save {
            Self::load_or_backup(&self.collection_path(collection))
        } else {
            HashMap::new()
        };
        let mut collections = self.collections.write();
        collections.entry(collection.to_string()).or_insert(documents);
    }

    /// Read a collection file, backing up a corrupted one instead of failing.
    fn load_or_backup(path: &Path) -> HashMap<String, Value> {
        if !path.exists() {
            return HashMap::new();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read collection file");
                return HashMap::new();
            }
        };
        match serde_json::from_str(&content) {
            Ok(documents) => documents,
            Err(err) => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                let backup = path.with_extension(format!("corrupt.{timestamp}.json"));
                if let Err(rename_err) = fs::rename(path, &backup) {
                    warn!(
                        path = %path.display(),
                        error = %rename_err,
                        "failed to back up corrupted collection file"
                    );
                } else {
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %err,
                        "backed up corrupted collection file"
                    );
                }
                HashMap::new()
            }
        }
    }

    /// Persist a collection to disk atomically.
    fn save(&self, collection: &str) -> Result<(), StoreError> {
        if !self.auto_save {
            return Ok(());
        }
        let content = {
            let collections = self.collections.read();
            let documents = collections.get(collection).cloned().unwrap_or_default();
            serde_json::to_string_pretty(&documents)?
        };
        let path = self.collection_path(collection);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        IoWrite::write_all(&mut file, content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Fetch a document by id.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.ensure_loaded(collection);
        let collections = self.collections.read();
        collections.get(collection).and_then(|docs| docs.get(id)).cloned()
    }

    /// Insert or replace a document.
    pub fn put(&self, collection: &str, id: &str, document: Value) -> Result<(), StoreError> {
        self.ensure_loaded(collection);
        {
            let mut collections = self.collections.write();
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), document);
        }
        self.save(collection)
    }

    /// Remove a document, returning it if present.
    pub fn remove(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_loaded(collection);
        let removed = {
            let mut collections = self.collections.write();
            collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
        };
        if removed.is_some() {
            self.save(collection)?;
        }
        Ok(removed)
    }

    /// All documents in a collection.
    pub fn values(&self, collection: &str) -> Vec<Value> {
        self.ensure_loaded(collection);
        let collections = self.collections.read();
        collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// First document matching the predicate.
    pub fn find_first(
        &self,
        collection: &str,
        predicate: impl Fn(&Value) -> bool,
    ) -> Option<Value> {
        self.ensure_loaded(collection);
        let collections = self.collections.read();
        collections
            .get(collection)
            .and_then(|docs| docs.values().find(|doc| predicate(doc)).cloned())
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.ensure_loaded(collection);
        let collections = self.collections.read();
        collections.get(collection).map(|docs| docs.len()).unwrap_or(0)
    }
}
