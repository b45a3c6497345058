//! Persistent gallery of enrolled face embeddings.
//!
//! Every mutation rewrites the whole file (temporary file + rename) before the
//! call returns, so a successful `register` survives a crash immediately after.
//! A failed persist leaves the in-memory change in place; callers may retry
//! with [`EmbeddingStore::persist`].

use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::UNKNOWN_LABEL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// On-disk format version written into every gallery file.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery file {path}: {reason}")]
    Format { path: PathBuf, reason: String },
}

/// One enrolled embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: Uuid,
    pub label: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    saved_at: DateTime<Utc>,
    dimension: usize,
    entries: Vec<GalleryEntry>,
}

/// Summary of the gallery contents.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryStats {
    pub path: PathBuf,
    pub total_embeddings: usize,
    pub unique_persons: usize,
    pub dimension: usize,
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
}

/// Insertion-ordered store of (label, vector) entries with write-through persistence.
pub struct EmbeddingStore {
    path: PathBuf,
    dimension: usize,
    entries: Vec<GalleryEntry>,
    saved_at: Option<DateTime<Utc>>,
}

impl EmbeddingStore {
    /// Open the gallery at `path`, loading it if the file exists.
    ///
    /// A missing file yields an empty store; nothing is written until the
    /// first mutation.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, GalleryError> {
        let path = path.into();
        if dimension == 0 {
            return Err(GalleryError::InvalidInput(
                "embedding dimension must be non-zero".into(),
            ));
        }

        if !path.exists() {
            tracing::info!(path = %path.display(), "no gallery file; starting empty");
            return Ok(Self {
                path,
                dimension,
                entries: Vec::new(),
                saved_at: None,
            });
        }

        let raw = std::fs::read(&path).map_err(|source| GalleryError::Storage {
            path: path.clone(),
            source,
        })?;
        let file: GalleryFile =
            serde_json::from_slice(&raw).map_err(|e| GalleryError::Format {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if file.version > GALLERY_FORMAT_VERSION {
            return Err(GalleryError::Format {
                path,
                reason: format!(
                    "unsupported format version {} (newest known: {GALLERY_FORMAT_VERSION})",
                    file.version
                ),
            });
        }
        if file.dimension != dimension {
            return Err(GalleryError::Format {
                path,
                reason: format!(
                    "gallery holds {}-dim embeddings, configured for {dimension}",
                    file.dimension
                ),
            });
        }
        if let Some(bad) = file.entries.iter().find(|e| e.vector.len() != dimension) {
            return Err(GalleryError::Format {
                path,
                reason: format!(
                    "entry {} has {} values, expected {dimension}",
                    bad.id,
                    bad.vector.len()
                ),
            });
        }

        let store = Self {
            path,
            dimension,
            entries: file.entries,
            saved_at: Some(file.saved_at),
        };
        tracing::info!(
            path = %store.path.display(),
            embeddings = store.entries.len(),
            persons = store.labels().len(),
            "loaded gallery"
        );
        Ok(store)
    }

    /// Append an embedding for `label` and persist.
    ///
    /// Returns the id assigned to the new entry.
    pub fn register(&mut self, label: &str, vector: Vec<f32>) -> Result<Uuid, GalleryError> {
        let label = validate_label(label)?;
        if vector.len() != self.dimension {
            return Err(GalleryError::InvalidInput(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(GalleryError::InvalidInput(
                "embedding contains non-finite values".into(),
            ));
        }

        let id = Uuid::new_v4();
        self.entries.push(GalleryEntry {
            id,
            label: label.to_string(),
            vector,
            created_at: Utc::now(),
        });
        self.persist()?;

        tracing::info!(label, id = %id, total = self.entries.len(), "embedding registered");
        Ok(id)
    }

    /// Delete every embedding of `label`. Returns how many were removed.
    ///
    /// Removing an unknown label is not an error and writes nothing.
    pub fn remove(&mut self, label: &str) -> Result<usize, GalleryError> {
        let label = label.trim();
        let before = self.entries.len();
        self.entries.retain(|e| e.label != label);
        let removed = before - self.entries.len();

        if removed > 0 {
            self.persist()?;
            tracing::info!(label, removed, "identity removed");
        }
        Ok(removed)
    }

    /// Rewrite the gallery file from the in-memory state.
    pub fn persist(&mut self) -> Result<(), GalleryError> {
        let saved_at = Utc::now();
        let file = GalleryFile {
            version: GALLERY_FORMAT_VERSION,
            saved_at,
            dimension: self.dimension,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| GalleryError::Format {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        write_atomically(&self.path, &bytes).map_err(|source| {
            tracing::error!(path = %self.path.display(), error = %source, "gallery persist failed");
            GalleryError::Storage {
                path: self.path.clone(),
                source,
            }
        })?;

        self.saved_at = Some(saved_at);
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "gallery saved");
        Ok(())
    }

    /// Nearest-neighbour lookup with the Euclidean metric.
    pub fn match_vector(&self, query: &[f32], threshold: f32) -> MatchResult {
        if query.len() != self.dimension {
            tracing::warn!(
                expected = self.dimension,
                got = query.len(),
                "query embedding has wrong dimension"
            );
            return MatchResult::unknown(f32::INFINITY);
        }
        EuclideanMatcher.compare(query, &self.entries, threshold)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Unique labels in first-registration order.
    pub fn labels(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.label.as_str()))
            .map(|e| e.label.as_str())
            .collect()
    }

    /// Number of embeddings enrolled for `label`.
    pub fn count_for(&self, label: &str) -> usize {
        self.entries.iter().filter(|e| e.label == label).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> GalleryStats {
        GalleryStats {
            path: self.path.clone(),
            total_embeddings: self.entries.len(),
            unique_persons: self.labels().len(),
            dimension: self.dimension,
            version: GALLERY_FORMAT_VERSION,
            saved_at: self.saved_at,
        }
    }
}

/// Trim and check a person label.
pub fn validate_label(label: &str) -> Result<&str, GalleryError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(GalleryError::InvalidInput("label must not be empty".into()));
    }
    if label.eq_ignore_ascii_case(UNKNOWN_LABEL) {
        return Err(GalleryError::InvalidInput(format!(
            "\"{UNKNOWN_LABEL}\" is reserved"
        )));
    }
    Ok(label)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
