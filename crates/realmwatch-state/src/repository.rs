//! Storage seam used by the scheduler.

use crate::error::StateResult;
use crate::store::StatusStore;
use crate::types::*;

/// Persistence operations the scheduler and API depend on.
///
/// Implemented by [`StatusStore`]; tests substitute failing or slow
/// backends. All methods are blocking and are expected to be called from
/// the blocking thread pool.
pub trait StatusRepository: Send + Sync {
    /// Append a snapshot. Never overwrites; returns the stored record.
    fn append(&self, record: NewStatusRecord) -> StateResult<StatusRecord>;

    /// Most recent snapshot for a realm.
    fn latest(&self, principal: &str) -> StateResult<Option<StatusRecord>>;

    /// Snapshots for a realm, newest first, at most `limit`, optionally only
    /// those with `created_at < before`.
    fn history(
        &self,
        principal: &str,
        limit: usize,
        before: Option<u64>,
    ) -> StateResult<Vec<StatusRecord>>;

    /// Latest snapshot of every realm that has one.
    fn latest_all(&self) -> StateResult<Vec<StatusRecord>>;

    fn put_realm(&self, config: &RealmConfig) -> StateResult<()>;

    fn delete_realm(&self, principal: &str) -> StateResult<bool>;

    fn list_realms(&self) -> StateResult<Vec<RealmConfig>>;
}

impl StatusRepository for StatusStore {
    fn append(&self, record: NewStatusRecord) -> StateResult<StatusRecord> {
        StatusStore::append(self, record)
    }

    fn latest(&self, principal: &str) -> StateResult<Option<StatusRecord>> {
        StatusStore::latest(self, principal)
    }

    fn history(
        &self,
        principal: &str,
        limit: usize,
        before: Option<u64>,
    ) -> StateResult<Vec<StatusRecord>> {
        StatusStore::history(self, principal, limit, before)
    }

    fn latest_all(&self) -> StateResult<Vec<StatusRecord>> {
        StatusStore::latest_all(self)
    }

    fn put_realm(&self, config: &RealmConfig) -> StateResult<()> {
        StatusStore::put_realm(self, config)
    }

    fn delete_realm(&self, principal: &str) -> StateResult<bool> {
        StatusStore::delete_realm(self, principal)
    }

    fn list_realms(&self) -> StateResult<Vec<RealmConfig>> {
        StatusStore::list_realms(self)
    }
}
