//! Server-side document storage backed by redb.

/// Document row storage.
pub mod document;
/// Table definitions.
pub mod tables;

use crate::error::AppError;
use std::path::Path;
use std::sync::Arc;

pub use document::DocumentDb;

/// Database handle with access to the document tables.
pub struct Database {
    pub db: Arc<redb::Database>,
    pub documents: DocumentDb,
}

impl Database {
    /// Open (or create) the database under `db_path`.
    ///
    /// `db_path` is a directory; the redb file lives inside it as
    /// [`tables::REDB_FILE_NAME`].
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or redb fails
    /// to open the file.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let dir = db_path.as_ref();
        std::fs::create_dir_all(dir).map_err(|err| {
            AppError::StorageMessage(format!(
                "failed to create database directory {:?}: {}",
                dir, err
            ))
        })?;
        let db = Arc::new(redb::Database::create(dir.join(tables::REDB_FILE_NAME))?);
        let documents = DocumentDb::new(Arc::clone(&db))?;
        tracing::info!("opened document database at {:?}", dir);
        Ok(Self { db, documents })
    }
}
