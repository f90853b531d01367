//! Per-identity embedding store with a pluggable persistence backend.
//!
//! The in-memory map is the source of truth while the process runs. Every
//! mutation is written through the backend before it is acknowledged, and a
//! failed write leaves the map exactly as it was.

use crate::types::Embedding;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// User id → ordered enrollment embeddings.
pub type Records = BTreeMap<String, Vec<Embedding>>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no embeddings supplied for user {0}")]
    Empty(String),
    #[error("embedding {index} for user {user} is not a unit vector")]
    NotUnit { user: String, index: usize },
    #[error("embedding dimensions disagree for user {user}: {expected} vs {got}")]
    DimensionMismatch { user: String, expected: usize, got: usize },
    #[error("store I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store data: {0}")]
    Format(#[from] serde_json::Error),
}

/// Durable medium behind an [`EmbeddingStore`].
pub trait EmbeddingBackend: Send {
    /// Read everything persisted so far; `Ok(None)` when nothing exists yet.
    fn load(&self) -> Result<Option<Records>, StoreError>;

    /// Replace the persisted contents with `records`.
    fn persist(&mut self, records: &Records) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

/// A single pretty-printed JSON file `{ "user": [[f32, ...], ...] }`.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl EmbeddingBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<Records>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(&self.path, e)),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn persist(&mut self, records: &Records) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }

        let bytes = serde_json::to_vec_pretty(records)?;

        // Write a sibling temp file, then rename over the target so readers
        // never observe a partial store.
        let temp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        if let Err(e) = write().and_then(|()| fs::rename(&temp_path, &self.path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_err(&self.path, e));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Volatile backend for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBackend {
    records: Option<Records>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Records) -> Self {
        Self { records: Some(records) }
    }
}

impl EmbeddingBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Records>, StoreError> {
        Ok(self.records.clone())
    }

    fn persist(&mut self, records: &Records) -> Result<(), StoreError> {
        self.records = Some(records.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct EmbeddingStore {
    records: Records,
    backend: Box<dyn EmbeddingBackend>,
}

impl EmbeddingStore {
    /// Rehydrate from the backend.
    ///
    /// Missing or malformed storage yields an empty store with a warning;
    /// individual records that fail validation are dropped.
    pub fn open(backend: Box<dyn EmbeddingBackend>) -> Self {
        let records = match backend.load() {
            Ok(Some(raw)) => sanitize(raw),
            Ok(None) => {
                tracing::info!(
                    store = %backend.describe(),
                    "no persisted embeddings, starting empty"
                );
                Records::new()
            }
            Err(e) => {
                tracing::warn!(
                    store = %backend.describe(),
                    error = %e,
                    "unreadable embedding store, starting empty"
                );
                Records::new()
            }
        };

        tracing::info!(
            store = %backend.describe(),
            users = records.len(),
            "embedding store opened"
        );
        Self { records, backend }
    }

    /// Replace the record for `user_id` with `embeddings`, persisting first.
    pub fn register(
        &mut self,
        user_id: &str,
        embeddings: Vec<Embedding>,
    ) -> Result<(), StoreError> {
        validate(user_id, &embeddings)?;
        let count = embeddings.len();

        let previous = self.records.insert(user_id.to_string(), embeddings);
        if let Err(e) = self.backend.persist(&self.records) {
            match previous {
                Some(prev) => self.records.insert(user_id.to_string(), prev),
                None => self.records.remove(user_id),
            };
            return Err(e);
        }

        tracing::info!(user = user_id, embeddings = count, "stored enrollment");
        Ok(())
    }

    /// Embeddings for `user_id`, empty for an unknown user.
    pub fn get(&self, user_id: &str) -> &[Embedding] {
        self.records.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn exists(&self, user_id: &str) -> bool {
        self.records.contains_key(user_id)
    }

    /// Remove `user_id`. Returns `Ok(false)` if there was nothing to remove.
    pub fn delete(&mut self, user_id: &str) -> Result<bool, StoreError> {
        let Some(removed) = self.records.remove(user_id) else {
            return Ok(false);
        };
        if let Err(e) = self.backend.persist(&self.records) {
            self.records.insert(user_id.to_string(), removed);
            return Err(e);
        }

        tracing::info!(user = user_id, "deleted enrollment");
        Ok(true)
    }

    /// Number of enrolled users.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn validate(user_id: &str, embeddings: &[Embedding]) -> Result<(), StoreError> {
    let first = embeddings.first().ok_or_else(|| StoreError::Empty(user_id.to_string()))?;
    for (index, e) in embeddings.iter().enumerate() {
        if !e.is_unit() {
            return Err(StoreError::NotUnit {
                user: user_id.to_string(),
                index,
            });
        }
        if e.dim() != first.dim() {
            return Err(StoreError::DimensionMismatch {
                user: user_id.to_string(),
                expected: first.dim(),
                got: e.dim(),
            });
        }
    }
    Ok(())
}

fn sanitize(raw: Records) -> Records {
    raw.into_iter()
        .filter(|(user, embeddings)| match validate(user, embeddings) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "dropping invalid stored record");
                false
            }
        })
        .collect()
}
