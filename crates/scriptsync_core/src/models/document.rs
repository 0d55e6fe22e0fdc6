//! Document data models shared by the client cache, the stores, and the server.

use crate::clock::Stamp;
use crate::constants::DEFAULT_DOCUMENT_TITLE;
use crate::text::normalize_line_endings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, stable document identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier for a newly created document.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// `true` when the id is empty or whitespace-only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who can see a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    /// Normalize an arbitrary visibility string into the allowed value set.
    ///
    /// Anything other than `public` (trimmed, any case) is private.
    pub fn normalize(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("public") {
            Self::Public
        } else {
            Self::Private
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
        }
    }
}

impl From<String> for Visibility {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl From<Visibility> for String {
    fn from(value: Visibility) -> Self {
        value.as_str().to_string()
    }
}

/// One formatted line of a structured script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLine {
    /// Format tag such as `scene-heading`, `action`, or `dialogue`.
    pub kind: String,
    pub text: String,
}

impl ScriptLine {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }
}

/// Structured script body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lines {
    pub lines: Vec<ScriptLine>,
}

/// Document body: plain text or a structured line list.
///
/// On the wire this is either a JSON string or `{"lines": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(Lines),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn structured(lines: Vec<ScriptLine>) -> Self {
        Self::Structured(Lines { lines })
    }

    /// Canonical comparable string form.
    ///
    /// Text is compared with normalized line endings. Structured content is
    /// rendered as compact JSON of its lines, so a change of line format alone
    /// still counts as a change.
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(text) => normalize_line_endings(text).into_owned(),
            Self::Structured(lines) => serde_json::Value::Array(
                lines
                    .lines
                    .iter()
                    .map(|line| {
                        serde_json::json!({
                            "kind": line.kind,
                            "text": normalize_line_endings(&line.text),
                        })
                    })
                    .collect(),
            )
            .to_string(),
        }
    }

    /// `true` when both bodies normalize to the same canonical form.
    pub fn same_as(&self, other: &Content) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => normalize_line_endings(a) == normalize_line_endings(b),
            _ => self.canonical() == other.canonical(),
        }
    }

    /// Plain text rendering, one line per structured entry.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text(text) => normalize_line_endings(text).into_owned(),
            Self::Structured(lines) => lines
                .lines
                .iter()
                .map(|line| normalize_line_endings(&line.text).into_owned())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Size used for content limits: byte length of the canonical form.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Structured(_) => self.canonical().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Structured(lines) => lines.lines.is_empty(),
        }
    }
}

/// Canonical document state as held by the client cache and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub author: String,
    pub description: String,
    pub visibility: Visibility,
    pub content: Content,
    /// Server-assigned version; never fabricated locally.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Local clock stamp of the last in-memory change.
    #[serde(skip)]
    pub local_stamp: Stamp,
}

impl Document {
    /// Create a first-version document with a generated id.
    pub fn new(title: impl Into<String>, content: Content) -> Self {
        let now = Utc::now();
        let title = title.into();
        Self {
            id: DocumentId::generate(),
            title: if title.trim().is_empty() {
                DEFAULT_DOCUMENT_TITLE.to_string()
            } else {
                title
            },
            author: String::new(),
            description: String::new(),
            visibility: Visibility::Private,
            content,
            version: 1,
            created_at: now,
            updated_at: now,
            local_stamp: Stamp::default(),
        }
    }
}

/// Lenient wire form of a document as returned by a remote store.
///
/// Every field is optional so malformed responses can be detected and
/// rejected during standardization instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Document> for DocumentRecord {
    fn from(value: &Document) -> Self {
        Self {
            id: Some(value.id.to_string()),
            title: Some(value.title.clone()),
            author: Some(value.author.clone()),
            description: Some(value.description.clone()),
            visibility: Some(value.visibility.as_str().to_string()),
            content: Some(value.content.clone()),
            version: Some(value.version),
            created_at: Some(value.created_at),
            updated_at: Some(value.updated_at),
        }
    }
}

/// Lightweight row used for list state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub author: String,
    pub visibility: Visibility,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub content_len: usize,
}

impl From<&Document> for DocumentSummary {
    fn from(value: &Document) -> Self {
        Self {
            id: value.id.clone(),
            title: value.title.clone(),
            author: value.author.clone(),
            visibility: value.visibility,
            version: value.version,
            updated_at: value.updated_at,
            content_len: value.content.size_bytes(),
        }
    }
}

/// Request payload for creating a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateDocumentRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub content: Option<Content>,
}

/// Request payload for updating a document.
///
/// `content`, `title`, and the base `version` are always sent; the server
/// rejects the write when `version` is not its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDocumentRequest {
    pub content: Content,
    pub title: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

/// Query parameters for listing documents.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}
