//! HTTP status fetcher: `GET <realm url><status_path>?network=<network>`.

use std::time::Duration;

use realm_core::{RealmConfig, StatusPayload};
use tracing::debug;

use crate::fetcher::{FetchError, FetchFuture, StatusFetcher, truncate_message};

const USER_AGENT: &str = concat!("realmwatch/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY_CHARS: usize = 256;

/// Fetches a realm's status document over HTTP(S).
#[derive(Clone)]
pub struct HttpStatusFetcher {
    client: reqwest::Client,
    status_path: String,
}

impl HttpStatusFetcher {
    pub fn new(status_path: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            status_path: status_path.into(),
        })
    }

    fn status_url(&self, realm: &RealmConfig) -> String {
        let base = realm.url.trim_end_matches('/');
        if self.status_path.is_empty() {
            return base.to_string();
        }
        format!("{}/{}", base, self.status_path.trim_start_matches('/'))
    }

    async fn fetch_inner(
        &self,
        realm: &RealmConfig,
        network: &str,
        timeout: Duration,
    ) -> Result<StatusPayload, FetchError> {
        let url = self.status_url(realm);
        debug!(principal = %realm.principal, %url, "fetching realm status over http");

        let response = self
            .client
            .get(&url)
            .query(&[("network", network)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body);
            return Err(FetchError::RemoteError {
                code: i32::from(status.as_u16()),
                message: truncate_message(&message, MAX_ERROR_BODY_CHARS),
            });
        }

        StatusPayload::from_slice(&body).map_err(|e| FetchError::MalformedResponse(e.to_string()))
    }
}

impl StatusFetcher for HttpStatusFetcher {
    fn fetch<'a>(
        &'a self,
        realm: &'a RealmConfig,
        network: &'a str,
        timeout: Duration,
    ) -> FetchFuture<'a> {
        Box::pin(self.fetch_inner(realm, network, timeout))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        FetchError::MalformedResponse(err.to_string())
    } else {
        FetchError::Unreachable(err.to_string())
    }
}
