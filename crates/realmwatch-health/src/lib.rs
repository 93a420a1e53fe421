//! realmwatch-health: scoring, backoff, and status fetching for realms.
//!
//! Provides the pieces one fetch cycle is made of: a [`StatusFetcher`] that
//! performs a single bounded remote call, the table-driven [`HealthScorer`]
//! that turns a status payload into a 0–100 score, and the
//! [`HealthTracker`] that counts consecutive failures and computes the
//! exponential backoff before the next attempt.
//!
//! # Architecture
//!
//! ```text
//! fetch cycle (driven by the scheduler)
//!   ├── StatusFetcher::fetch() → StatusPayload | FetchError
//!   │   ├── HttpStatusFetcher  (GET <url><status_path>)
//!   │   └── DfxStatusFetcher   (dfx canister call <principal> status)
//!   ├── HealthScorer::score() → 0..=100 | ScoreError
//!   └── HealthTracker::record_*() → next delay
//! ```
//!
//! # Backoff
//!
//! Failures back off exponentially from `retry_base` up to `max_backoff`.
//! A single success resets the delay to the realm's nominal interval.

pub mod dfx;
pub mod fetcher;
pub mod http;
pub mod rubric;
pub mod tracker;

pub use dfx::DfxStatusFetcher;
pub use fetcher::{FetchError, FetchFuture, StatusFetcher, fetch_with_timeout};
pub use http::HttpStatusFetcher;
pub use rubric::{HealthScorer, RubricRule, RuleOutcome, ScoreError, Signal};
pub use tracker::{BackoffPolicy, HealthTracker, RealmHealth};
