//! Persisted client preferences restored on session start.

use crate::models::DocumentId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrefsError {
    #[error("preferences I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("preferences encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cursor and scroll position inside one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub document: DocumentId,
    /// Character offset of the caret.
    pub offset: usize,
    /// First visible line.
    pub scroll_line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPrefs {
    #[serde(default)]
    pub last_document: Option<DocumentId>,
    #[serde(default)]
    pub cursor: Option<CursorSnapshot>,
}

impl ClientPrefs {
    /// Cursor snapshot for `id`, if the stored one belongs to it.
    pub fn cursor_for(&self, id: &DocumentId) -> Option<&CursorSnapshot> {
        self.cursor.as_ref().filter(|cursor| &cursor.document == id)
    }
}

/// Small key-value persistence for [`ClientPrefs`].
pub trait PrefsStore: Send + Sync {
    /// Load preferences; unreadable state yields defaults.
    fn load(&self) -> ClientPrefs;

    fn save(&self, prefs: &ClientPrefs) -> Result<(), PrefsError>;
}

/// Preferences kept for the lifetime of the process.
#[derive(Default)]
pub struct MemoryPrefs {
    prefs: Mutex<ClientPrefs>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefsStore for MemoryPrefs {
    fn load(&self) -> ClientPrefs {
        self.prefs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, prefs: &ClientPrefs) -> Result<(), PrefsError> {
        *self.prefs.lock().unwrap_or_else(PoisonError::into_inner) = prefs.clone();
        Ok(())
    }
}

/// Preferences stored as a JSON file.
pub struct FilePrefs {
    path: PathBuf,
}

impl FilePrefs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PrefsStore for FilePrefs {
    fn load(&self) -> ClientPrefs {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ClientPrefs::default()
            }
            Err(err) => {
                tracing::warn!("failed to read preferences {:?}: {}", self.path, err);
                return ClientPrefs::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!("ignoring malformed preferences {:?}: {}", self.path, err);
            ClientPrefs::default()
        })
    }

    fn save(&self, prefs: &ClientPrefs) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec_pretty(prefs)?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, encoded)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
