//! dfx status fetcher: `dfx canister call --network <n> --output json <principal> status`.

use std::process::Stdio;
use std::time::Duration;

use realm_core::{RealmConfig, StatusPayload};
use tokio::process::Command;
use tracing::debug;

use crate::fetcher::{FetchError, FetchFuture, StatusFetcher, truncate_message};

const MAX_STDERR_CHARS: usize = 512;

/// Queries a realm canister's `status` method through the dfx CLI.
#[derive(Debug, Clone)]
pub struct DfxStatusFetcher {
    binary: String,
}

impl DfxStatusFetcher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, realm: &RealmConfig, network: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["canister", "call", "--network", network, "--output", "json"])
            .arg(&realm.principal)
            .arg("status")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if network == "ic" {
            cmd.env("DFX_WARNING", "-mainnet_plaintext_identity");
        }
        cmd
    }

    async fn fetch_inner(
        &self,
        realm: &RealmConfig,
        network: &str,
        timeout: Duration,
    ) -> Result<StatusPayload, FetchError> {
        debug!(principal = %realm.principal, network, binary = %self.binary, "calling realm status via dfx");

        let child = self
            .command(realm, network)
            .spawn()
            .map_err(|e| FetchError::Unreachable(format!("failed to run {}: {e}", self.binary)))?;

        // Dropping the `wait_with_output` future on timeout kills the child.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::RemoteError {
                code: output.status.code().unwrap_or(-1),
                message: truncate_message(&stderr, MAX_STDERR_CHARS),
            });
        }

        StatusPayload::from_slice(&output.stdout)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))
    }
}

impl Default for DfxStatusFetcher {
    fn default() -> Self {
        Self::new("dfx")
    }
}

impl StatusFetcher for DfxStatusFetcher {
    fn fetch<'a>(
        &'a self,
        realm: &'a RealmConfig,
        network: &'a str,
        timeout: Duration,
    ) -> FetchFuture<'a> {
        Box::pin(self.fetch_inner(realm, network, timeout))
    }
}
