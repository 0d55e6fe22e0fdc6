//! Document HTTP handlers.

use crate::{error::HttpError, AppState};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use scriptsync_core::constants::DEFAULT_LIST_DOCUMENTS_LIMIT;
use scriptsync_core::models::{
    Content, CreateDocumentRequest, Document, ListQuery, UpdateDocumentRequest,
};
use scriptsync_core::text::normalize_optional_nonempty;
use scriptsync_core::AppError;
use serde_json::{json, Value};

fn normalized_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_LIST_DOCUMENTS_LIMIT)
        .min(DEFAULT_LIST_DOCUMENTS_LIMIT)
}

fn check_content_size(state: &AppState, content: &Content) -> Result<(), HttpError> {
    if content.size_bytes() > state.config.max_content_size {
        return Err(AppError::BadRequest(format!(
            "Document size exceeds maximum of {} bytes",
            state.config.max_content_size
        ))
        .into());
    }
    Ok(())
}

/// Create a new document at version 1.
///
/// # Errors
/// Returns an error if validation or persistence fails.
pub async fn create_document(
    State(state): State<AppState>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<Json<Document>, HttpError> {
    let content = req.content.unwrap_or_default();
    check_content_size(&state, &content)?;

    let mut document = Document::new(req.title.unwrap_or_default(), content);
    document.author = normalize_optional_nonempty(req.author).unwrap_or_default();
    document.description = req.description.unwrap_or_default();
    document.visibility = req.visibility.unwrap_or_default();

    state.db.documents.create(&document)?;
    tracing::info!(id = %document.id, "created document");
    Ok(Json(document))
}

/// Fetch a document by id.
///
/// # Errors
/// Returns an error if the document does not exist or lookup fails.
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, HttpError> {
    state
        .db
        .documents
        .get(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound.into())
}

/// Write a new version of a document.
///
/// The request's `version` must equal the stored version; otherwise the
/// write is rejected with 409 and the current version.
///
/// # Errors
/// Returns an error on size violations, missing documents, version
/// conflicts, or storage failures.
pub async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDocumentRequest>,
) -> Result<Json<Document>, HttpError> {
    check_content_size(&state, &req.content)?;
    match state.db.documents.update(&id, &req) {
        Ok(document) => {
            tracing::debug!(id = %id, version = document.version, "updated document");
            Ok(Json(document))
        }
        Err(AppError::Conflict { expected, current }) => {
            tracing::info!(
                id = %id,
                expected,
                current,
                "rejected write based on a stale version"
            );
            Err(AppError::Conflict { expected, current }.into())
        }
        Err(err) => Err(err.into()),
    }
}

/// Delete a document by id.
///
/// # Errors
/// Returns an error if the document does not exist or deletion fails.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    if state.db.documents.delete(&id)? {
        tracing::info!(id = %id, "deleted document");
        Ok(Json(json!({ "success": true })))
    } else {
        Err(AppError::NotFound.into())
    }
}

/// List documents, most recently updated first.
///
/// # Errors
/// Returns an error if listing fails.
pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>, HttpError> {
    let limit = normalized_limit(query.limit);
    Ok(Json(state.db.documents.list(limit)?))
}

#[cfg(test)]
mod tests {
    use super::normalized_limit;
    use scriptsync_core::constants::DEFAULT_LIST_DOCUMENTS_LIMIT;

    #[test]
    fn list_limit_defaults_and_caps() {
        assert_eq!(normalized_limit(None), DEFAULT_LIST_DOCUMENTS_LIMIT);
        assert_eq!(normalized_limit(Some(3)), 3);
        assert_eq!(
            normalized_limit(Some(DEFAULT_LIST_DOCUMENTS_LIMIT * 4)),
            DEFAULT_LIST_DOCUMENTS_LIMIT
        );
    }
}
