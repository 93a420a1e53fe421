//! Scheduler error types.

use std::time::Duration;

use realm_core::RealmConfigError;
use realmwatch_health::{FetchError, ScoreError};
use realmwatch_state::StateError;
use thiserror::Error;

/// Registry administration errors. Fatal to the call only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("realm already registered: {0}")]
    DuplicateTarget(String),

    #[error("realm not found: {0}")]
    NotFound(String),

    #[error("invalid realm config: {0}")]
    InvalidConfig(#[from] RealmConfigError),
}

/// A store call made from async code on the blocking pool.
#[derive(Debug, Error)]
pub enum StoreCallError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Why one fetch cycle of one realm failed.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unscorable status payload: {0}")]
    Score(#[from] ScoreError),

    #[error(transparent)]
    Store(#[from] StoreCallError),

    #[error("fetch cycle aborted: {0}")]
    Aborted(String),
}

impl CycleError {
    /// Classification surfaced as `last_error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Score(_) => "score_error",
            Self::Store(StoreCallError::State(_)) => "store_error",
            Self::Store(StoreCallError::Timeout(_)) => "store_timeout",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Errors returned by the scheduler's control surface.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no status recorded for realm: {0}")]
    NoStatus(String),

    #[error("fetch already in flight for realm: {0}")]
    InFlight(String),

    #[error("fetch failed for {principal}: {source}")]
    Cycle {
        principal: String,
        #[source]
        source: CycleError,
    },

    #[error(transparent)]
    Store(#[from] StoreCallError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
