//! Domain types for the Realmwatch status store.

use serde::{Deserialize, Serialize};

pub use realm_core::{Principal, RealmConfig, StatusPayload};

/// Surrogate key of a stored snapshot. Strictly increasing across the store.
pub type RecordId = u64;

/// One immutable, timestamped capture of a realm's reported status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub id: RecordId,
    pub realm_principal: Principal,
    pub realm_url: String,
    pub status_payload: StatusPayload,
    /// Health score in `[0, 100]`.
    pub health_score: u8,
    /// Unix timestamp (milliseconds) when the snapshot was taken.
    pub created_at: u64,
}

/// A snapshot that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusRecord {
    pub realm_principal: Principal,
    pub realm_url: String,
    pub status_payload: StatusPayload,
    pub health_score: u8,
    pub created_at: u64,
}

impl NewStatusRecord {
    pub(crate) fn into_record(self, id: RecordId, created_at: u64) -> StatusRecord {
        StatusRecord {
            id,
            realm_principal: self.realm_principal,
            realm_url: self.realm_url,
            status_payload: self.status_payload,
            health_score: self.health_score,
            created_at,
        }
    }
}
