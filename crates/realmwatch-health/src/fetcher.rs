//! The `StatusFetcher` seam: one bounded remote call per fetch cycle.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use realm_core::{RealmConfig, StatusPayload};
use thiserror::Error;

/// Boxed future returned by [`StatusFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<StatusPayload, FetchError>> + Send + 'a>>;

/// Why a single fetch produced no payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("realm unreachable: {0}")]
    Unreachable(String),

    #[error("malformed status response: {0}")]
    MalformedResponse(String),

    #[error("realm returned error {code}: {message}")]
    RemoteError { code: i32, message: String },
}

impl FetchError {
    /// Stable classification name, surfaced as `last_error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unreachable(_) => "unreachable",
            Self::MalformedResponse(_) => "malformed_response",
            Self::RemoteError { .. } => "remote_error",
        }
    }
}

/// Retrieves the current status payload of one realm.
///
/// Implementations must not retry internally and should respect `timeout`;
/// callers additionally enforce it with [`fetch_with_timeout`].
pub trait StatusFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        realm: &'a RealmConfig,
        network: &'a str,
        timeout: Duration,
    ) -> FetchFuture<'a>;
}

/// Run one fetch under a hard deadline.
///
/// A fetcher that ignores its own timeout is cancelled here and reported as
/// [`FetchError::Timeout`].
pub async fn fetch_with_timeout(
    fetcher: &dyn StatusFetcher,
    realm: &RealmConfig,
    network: &str,
    timeout: Duration,
) -> Result<StatusPayload, FetchError> {
    match tokio::time::timeout(timeout, fetcher.fetch(realm, network, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

/// Trim a remote message so it stays readable in logs and `last_error`.
pub(crate) fn truncate_message(message: &str, max_chars: usize) -> String {
    let trimmed = message.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
