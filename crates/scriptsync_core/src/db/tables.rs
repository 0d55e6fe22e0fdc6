//! redb table definitions shared by storage modules.

use redb::TableDefinition;

/// File name for the redb database within the configured DB directory.
pub const REDB_FILE_NAME: &str = "data.redb";

/// Canonical document rows (`DocumentRow`, bincode-encoded).
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Recency index ordered by reverse-millis then id.
pub const DOCUMENTS_BY_UPDATED: TableDefinition<(u64, &str), ()> =
    TableDefinition::new("documents_by_updated");
