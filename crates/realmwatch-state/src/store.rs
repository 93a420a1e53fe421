//! StatusStore: redb-backed snapshot persistence for Realmwatch.
//!
//! Snapshots are append-only. Every write runs in its own redb write
//! transaction, so id assignment and the per-realm `created_at` ordering
//! check are serialized. Reads run in MVCC read transactions and only ever
//! observe fully committed appends.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe status store backed by redb.
#[derive(Clone)]
pub struct StatusStore {
    db: Arc<Database>,
}

impl StatusStore {
    /// Open (or create) a persistent status store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "status store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory status store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory status store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STATUS_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(STATUS_BY_REALM).map_err(map_err!(Table))?;
        txn.open_table(REALMS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Status records ─────────────────────────────────────────────

    /// Append a snapshot and return it with its assigned id.
    ///
    /// If the caller's clock went backwards relative to the realm's previous
    /// snapshot, `created_at` is raised to the previous value so per-realm
    /// timestamps stay non-decreasing in insertion order.
    pub fn append(&self, record: NewStatusRecord) -> StateResult<StatusRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut records = txn.open_table(STATUS_RECORDS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(STATUS_BY_REALM).map_err(map_err!(Table))?;

            let id = match records.last().map_err(map_err!(Read))? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };

            let principal = record.realm_principal.clone();
            let previous = index
                .range((principal.as_str(), 0u64)..=(principal.as_str(), u64::MAX))
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(_, created_at)| created_at.value());

            let created_at = match previous {
                Some(prev) if record.created_at < prev => {
                    debug!(%principal, requested = record.created_at, prev, "clamped snapshot timestamp");
                    prev
                }
                _ => record.created_at,
            };

            stored = record.into_record(id, created_at);
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            records
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            index
                .insert((principal.as_str(), id), created_at)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = stored.id, principal = %stored.realm_principal, "status record stored");
        Ok(stored)
    }

    /// Most recent snapshot for a realm.
    pub fn latest(&self, principal: &str) -> StateResult<Option<StatusRecord>> {
        Ok(self.history(principal, 1, None)?.pop())
    }

    /// Snapshots for a realm, newest first.
    ///
    /// Returns at most `limit` records. With `before`, only records whose
    /// `created_at` is strictly older than it are returned, which lets
    /// callers page backwards using the oldest timestamp of the last page.
    pub fn history(
        &self,
        principal: &str,
        limit: usize,
        before: Option<u64>,
    ) -> StateResult<Vec<StatusRecord>> {
        let mut results = Vec::new();
        if limit == 0 {
            return Ok(results);
        }

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(STATUS_BY_REALM).map_err(map_err!(Table))?;
        let records = txn.open_table(STATUS_RECORDS).map_err(map_err!(Table))?;

        let range = index
            .range((principal, 0u64)..=(principal, u64::MAX))
            .map_err(map_err!(Read))?;
        for entry in range.rev() {
            let (key, created_at) = entry.map_err(map_err!(Read))?;
            if before.is_some_and(|cutoff| created_at.value() >= cutoff) {
                continue;
            }
            let (_, id) = key.value();
            results.push(read_record(&records, id)?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Latest snapshot of every realm that has at least one, in principal
    /// order.
    ///
    /// Seeks the index once per realm instead of walking every record.
    pub fn latest_all(&self) -> StateResult<Vec<StatusRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(STATUS_BY_REALM).map_err(map_err!(Table))?;
        let records = txn.open_table(STATUS_RECORDS).map_err(map_err!(Table))?;

        let mut newest = Vec::new();
        let mut cursor = index
            .first()
            .map_err(map_err!(Read))?
            .map(|(key, _)| key.value().0.to_string());

        while let Some(principal) = cursor {
            let last = index
                .range((principal.as_str(), 0u64)..=(principal.as_str(), u64::MAX))
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?;
            if let Some((key, _)) = last {
                let (_, id) = key.value();
                newest.push(read_record(&records, id)?);
            }

            // Index keys sort by (principal, id); the first key past this
            // realm's highest id belongs to the next realm.
            let upper = (principal.as_str(), u64::MAX);
            cursor = index
                .range((Bound::Excluded(upper), Bound::Unbounded))
                .map_err(map_err!(Read))?
                .next()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value().0.to_string());
        }

        Ok(newest)
    }

    // ── Realms ─────────────────────────────────────────────────────

    /// Insert or update a realm config.
    pub fn put_realm(&self, config: &RealmConfig) -> StateResult<()> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REALMS).map_err(map_err!(Table))?;
            table
                .insert(config.principal.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(principal = %config.principal, "realm config stored");
        Ok(())
    }

    /// Get a realm config by principal.
    pub fn get_realm(&self, principal: &str) -> StateResult<Option<RealmConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REALMS).map_err(map_err!(Table))?;
        match table.get(principal).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: RealmConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// List all persisted realm configs, ordered by principal.
    pub fn list_realms(&self) -> StateResult<Vec<RealmConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REALMS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let config: RealmConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(config);
        }
        Ok(results)
    }

    /// Delete a realm config. Returns true if it existed.
    ///
    /// Snapshots of the realm are kept.
    pub fn delete_realm(&self, principal: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(REALMS).map_err(map_err!(Table))?;
            existed = table.remove(principal).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%principal, existed, "realm config deleted");
        Ok(existed)
    }
}

fn read_record<T>(table: &T, id: RecordId) -> StateResult<StatusRecord>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let guard = table
        .get(id)
        .map_err(map_err!(Read))?
        .ok_or(StateError::MissingRecord(id))?;
    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
}
