//! realmwatch-state: embedded status store for Realmwatch.
//!
//! Backed by [redb](https://docs.rs/redb), persists realm status snapshots
//! and the realm registry.
//!
//! # Architecture
//!
//! Snapshots are JSON-serialized into the `status_records` table under a
//! monotonically increasing surrogate id. A secondary index keyed by
//! `(principal, id)` makes "latest" and newest-first history scans a
//! reverse range read over one realm's keys.
//!
//! Records are append-only: nothing in this crate updates or deletes a
//! stored snapshot. Removing a realm only drops its row in `realms`.
//!
//! The `StatusStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Consumers that need to substitute
//! the backend depend on the [`StatusRepository`] trait instead.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::StatusRepository;
pub use store::StatusStore;
pub use types::*;
