//! Partial document updates queued ahead of a remote write.

use super::document::{Content, Document, Visibility};
use crate::clock::Stamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partial field map of a document.
///
/// `None` means "not part of this patch", never "clear the field".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
}

impl DocumentPatch {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.description.is_none()
            && self.visibility.is_none()
            && self.content.is_none()
    }

    /// Names of the fields present in this patch, for logging and UI feedback.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.title.is_some() {
            names.push("title");
        }
        if self.author.is_some() {
            names.push("author");
        }
        if self.description.is_some() {
            names.push("description");
        }
        if self.visibility.is_some() {
            names.push("visibility");
        }
        if self.content.is_some() {
            names.push("content");
        }
        names
    }

    /// Fold a newer patch into this one; the newer value wins per field.
    pub fn merge(&mut self, newer: DocumentPatch) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.author.is_some() {
            self.author = newer.author;
        }
        if newer.description.is_some() {
            self.description = newer.description;
        }
        if newer.visibility.is_some() {
            self.visibility = newer.visibility;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
    }

    /// Keep only the fields whose value differs from `document`.
    pub fn effective_against(&self, document: &Document) -> DocumentPatch {
        DocumentPatch {
            title: self
                .title
                .as_ref()
                .filter(|title| **title != document.title)
                .cloned(),
            author: self
                .author
                .as_ref()
                .filter(|author| **author != document.author)
                .cloned(),
            description: self
                .description
                .as_ref()
                .filter(|description| **description != document.description)
                .cloned(),
            visibility: self
                .visibility
                .filter(|visibility| *visibility != document.visibility),
            content: self
                .content
                .as_ref()
                .filter(|content| !content.same_as(&document.content))
                .cloned(),
        }
    }

    /// Write every present field onto `document`.
    pub fn apply_to(&self, document: &mut Document) {
        if let Some(title) = &self.title {
            document.title = title.clone();
        }
        if let Some(author) = &self.author {
            document.author = author.clone();
        }
        if let Some(description) = &self.description {
            document.description = description.clone();
        }
        if let Some(visibility) = self.visibility {
            document.visibility = visibility;
        }
        if let Some(content) = &self.content {
            document.content = content.clone();
        }
    }
}

/// Why a patch was queued; surfaced with the dirty notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchReason {
    /// Direct typing in the editor.
    Typing,
    /// Title, author, description, or visibility edits.
    Metadata,
    /// Content change delivered through the sync trigger.
    ContentSync,
    /// Restoring an older version.
    Restore,
    Other(String),
}

impl fmt::Display for PatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typing => f.write_str("typing"),
            Self::Metadata => f.write_str("metadata"),
            Self::ContentSync => f.write_str("content-sync"),
            Self::Restore => f.write_str("restore"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Patch waiting to be flushed for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPatch {
    pub patch: DocumentPatch,
    pub reason: PatchReason,
    pub queued_at: Stamp,
}
