//! Readiness check for a freshly started management API

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::{E2eError, Result};
use crate::transport::ApiClient;

const META_PATH: &str = "/meta";

/// The subset of `GET /meta` the runner cares about
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMeta {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub api_token_enabled: Option<bool>,
}

/// Poll `GET /meta` every `interval` until it answers or `timeout` elapses.
///
/// The deadline is checked before each attempt; an in-flight request is
/// never cut short.
///
/// # Errors
///
/// [`E2eError::Timeout`] naming the configured timeout and the last error seen.
pub async fn wait_for_server(
    api: &ApiClient,
    timeout: Duration,
    interval: Duration,
) -> Result<ServerMeta> {
    let deadline = Instant::now() + timeout;
    let mut last_error: Option<E2eError> = None;

    while Instant::now() < deadline {
        match api
            .request_json::<ServerMeta>(Method::GET, META_PATH, None, None)
            .await
        {
            Ok(meta) => {
                info!(
                    version = meta.version.as_deref().unwrap_or("unknown"),
                    api_token_enabled = ?meta.api_token_enabled,
                    base_url = api.base_url(),
                    "Server ready"
                );
                return Ok(meta);
            }
            Err(err) => {
                debug!(error = %err, "Server not ready yet");
                last_error = Some(err);
                tokio::time::sleep(interval).await;
            }
        }
    }

    Err(E2eError::Timeout {
        what: "Server readiness".to_string(),
        timeout,
        last_error: last_error.map(|e| e.to_string()),
    })
}
