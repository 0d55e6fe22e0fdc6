//! Shared constants used across ScriptSync crates.

/// Default API port for the document server.
pub const DEFAULT_PORT: u16 = 38511;

/// Default base URL for clients talking to the document server.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:38511";

/// Default maximum document content size, in bytes, accepted locally and by the server.
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 5 * 1024 * 1024;

/// Default debounce window applied by the sync trigger, in milliseconds.
pub const DEFAULT_FLUSH_DEBOUNCE_MS: u64 = 1_500;

/// Default minimum gap between two accepted flushes of one document, in milliseconds.
pub const DEFAULT_MIN_FLUSH_INTERVAL_MS: u64 = 3_000;

/// Default base retry delay after a failed flush, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 2_000;

/// Upper bound for the rate-limit backoff, in milliseconds.
pub const DEFAULT_MAX_RETRY_INTERVAL_MS: u64 = 60_000;

/// Default per-client write budget for the server's fixed-window limiter.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 120;

/// Default upper bound for list endpoints.
pub const DEFAULT_LIST_DOCUMENTS_LIMIT: usize = 512;

/// Title given to documents created without one.
pub const DEFAULT_DOCUMENT_TITLE: &str = "Untitled Script";
