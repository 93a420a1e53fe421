//! redb table definitions for the Realmwatch status store.

use redb::TableDefinition;

/// Status snapshots keyed by surrogate record id (JSON values).
pub const STATUS_RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("status_records");

/// Per-realm index: `(principal, record id)` → `created_at` (Unix ms).
pub const STATUS_BY_REALM: TableDefinition<(&str, u64), u64> =
    TableDefinition::new("status_by_realm");

/// Registered realm configs keyed by principal (JSON values).
pub const REALMS: TableDefinition<&str, &[u8]> = TableDefinition::new("realms");
