//! Document row storage with optimistic version checks.

use super::tables::{DOCUMENTS, DOCUMENTS_BY_UPDATED};
use crate::clock::Stamp;
use crate::constants::DEFAULT_DOCUMENT_TITLE;
use crate::error::AppError;
use crate::models::{
    Content, Document, DocumentId, Lines, ScriptLine, UpdateDocumentRequest, Visibility,
};
use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Accessor for document rows.
pub struct DocumentDb {
    db: Arc<redb::Database>,
}

/// Persisted body; bincode cannot decode the untagged wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoredContent {
    Text(String),
    Structured(Vec<(String, String)>),
}

impl From<&Content> for StoredContent {
    fn from(value: &Content) -> Self {
        match value {
            Content::Text(text) => Self::Text(text.clone()),
            Content::Structured(lines) => Self::Structured(
                lines
                    .lines
                    .iter()
                    .map(|line| (line.kind.clone(), line.text.clone()))
                    .collect(),
            ),
        }
    }
}

impl From<StoredContent> for Content {
    fn from(value: StoredContent) -> Self {
        match value {
            StoredContent::Text(text) => Content::Text(text),
            StoredContent::Structured(lines) => Content::Structured(Lines {
                lines: lines
                    .into_iter()
                    .map(|(kind, text)| ScriptLine { kind, text })
                    .collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    id: String,
    title: String,
    author: String,
    description: String,
    public: bool,
    content: StoredContent,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Document> for DocumentRow {
    fn from(value: &Document) -> Self {
        Self {
            id: value.id.to_string(),
            title: value.title.clone(),
            author: value.author.clone(),
            description: value.description.clone(),
            public: value.visibility == Visibility::Public,
            content: StoredContent::from(&value.content),
            version: value.version,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<DocumentRow> for Document {
    fn from(value: DocumentRow) -> Self {
        Self {
            id: DocumentId::from(value.id),
            title: value.title,
            author: value.author,
            description: value.description,
            visibility: if value.public {
                Visibility::Public
            } else {
                Visibility::Private
            },
            content: value.content.into(),
            version: value.version,
            created_at: value.created_at,
            updated_at: value.updated_at,
            local_stamp: Stamp::default(),
        }
    }
}

fn encode(document: &Document) -> Result<Vec<u8>, AppError> {
    Ok(bincode::serialize(&DocumentRow::from(document))?)
}

fn decode(bytes: &[u8]) -> Result<Document, AppError> {
    Ok(bincode::deserialize::<DocumentRow>(bytes)?.into())
}

fn reverse_timestamp_key(updated_at: DateTime<Utc>) -> u64 {
    // Pre-epoch timestamps clamp to the oldest slot.
    let millis = updated_at.timestamp_millis().max(0) as u64;
    u64::MAX.saturating_sub(millis)
}

impl DocumentDb {
    /// Open document tables and return a storage accessor.
    ///
    /// # Errors
    /// Returns an error when table creation fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(DOCUMENTS)?;
        write_txn.open_table(DOCUMENTS_BY_UPDATED)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Insert a new document row and its recency index entry atomically.
    ///
    /// # Errors
    /// Returns an error when the id already exists or storage fails.
    pub fn create(&self, document: &Document) -> Result<(), AppError> {
        let encoded = encode(document)?;
        let id = document.id.as_str();
        let write_txn = self.db.begin_write()?;
        {
            let mut documents = write_txn.open_table(DOCUMENTS)?;
            let mut updated = write_txn.open_table(DOCUMENTS_BY_UPDATED)?;
            if documents.get(id)?.is_some() {
                return Err(AppError::StorageMessage(format!(
                    "Document with id '{}' already exists",
                    id
                )));
            }
            documents.insert(id, encoded.as_slice())?;
            updated.insert((reverse_timestamp_key(document.updated_at), id), ())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Fetch a document by id.
    ///
    /// # Returns
    /// `Ok(Some(document))` when present, `Ok(None)` when missing.
    ///
    /// # Errors
    /// Returns an error when storage access or decoding fails.
    pub fn get(&self, id: &str) -> Result<Option<Document>, AppError> {
        let read_txn = self.db.begin_read()?;
        let documents = read_txn.open_table(DOCUMENTS)?;
        match documents.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Apply `update` when `update.version` matches the stored version.
    ///
    /// The stored version is incremented by exactly one and `updated_at`
    /// is refreshed.
    ///
    /// # Errors
    /// - [`AppError::NotFound`] when the id is unknown.
    /// - [`AppError::Conflict`] when the base version is stale.
    /// - Storage or encoding failures.
    pub fn update(&self, id: &str, update: &UpdateDocumentRequest) -> Result<Document, AppError> {
        let write_txn = self.db.begin_write()?;
        let document = {
            let mut documents = write_txn.open_table(DOCUMENTS)?;
            let mut updated = write_txn.open_table(DOCUMENTS_BY_UPDATED)?;

            let Some(old_guard) = documents.get(id)? else {
                return Err(AppError::NotFound);
            };
            let mut document = decode(old_guard.value())?;
            drop(old_guard);

            if document.version != update.version {
                return Err(AppError::Conflict {
                    expected: update.version,
                    current: document.version,
                });
            }

            let old_recency_key = reverse_timestamp_key(document.updated_at);
            apply_update_request(&mut document, update);
            let new_recency_key = reverse_timestamp_key(document.updated_at);

            let encoded = encode(&document)?;
            documents.insert(id, encoded.as_slice())?;
            if old_recency_key != new_recency_key {
                let _ = updated.remove((old_recency_key, id))?;
            }
            updated.insert((new_recency_key, id), ())?;
            document
        };
        write_txn.commit()?;
        Ok(document)
    }

    /// Delete a document by id.
    ///
    /// # Returns
    /// `true` when a row was deleted, otherwise `false`.
    ///
    /// # Errors
    /// Returns an error when storage or decoding fails.
    pub fn delete(&self, id: &str) -> Result<bool, AppError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut documents = write_txn.open_table(DOCUMENTS)?;
            let mut updated = write_txn.open_table(DOCUMENTS_BY_UPDATED)?;

            let Some(old_guard) = documents.get(id)? else {
                return Ok(false);
            };
            let document = decode(old_guard.value())?;
            drop(old_guard);

            let _ = updated.remove((reverse_timestamp_key(document.updated_at), id))?;
            let _ = documents.remove(id)?;
            true
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// List documents sorted by `updated_at` descending.
    ///
    /// # Errors
    /// Returns an error when storage access or decoding fails.
    pub fn list(&self, limit: usize) -> Result<Vec<Document>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read()?;
        let updated_table = read_txn.open_table(DOCUMENTS_BY_UPDATED)?;
        let documents_table = read_txn.open_table(DOCUMENTS)?;
        let mut documents = Vec::new();

        for item in updated_table.iter()? {
            let (key, _) = item?;
            let (_, id) = key.value();
            let Some(guard) = documents_table.get(id)? else {
                continue;
            };
            documents.push(decode(guard.value())?);
            if documents.len() >= limit {
                break;
            }
        }

        Ok(documents)
    }
}

fn apply_update_request(document: &mut Document, update: &UpdateDocumentRequest) {
    document.content = update.content.clone();
    document.title = if update.title.trim().is_empty() {
        DEFAULT_DOCUMENT_TITLE.to_string()
    } else {
        update.title.clone()
    };
    if let Some(author) = &update.author {
        document.author = author.clone();
    }
    if let Some(description) = &update.description {
        document.description = description.clone();
    }
    if let Some(visibility) = update.visibility {
        document.visibility = visibility;
    }
    document.version += 1;
    // Keep recency strictly increasing so the index key always moves.
    let now = Utc::now();
    document.updated_at = if now > document.updated_at {
        now
    } else {
        document.updated_at + chrono::Duration::milliseconds(1)
    };
}
