//! Shared reqwest plumbing.

use std::time::Duration;

use promoter_core::{PromoterError, PromoterResult};
use tracing::debug;

pub const USER_AGENT: &str = concat!("dlrn-promoter/", env!("CARGO_PKG_VERSION"));

/// Build a client with the promoter user agent and a per-request timeout.
pub fn build_client(timeout: Duration) -> PromoterResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| PromoterError::Http(format!("unable to create HTTP client: {e}")))
}

pub fn transport(err: reqwest::Error) -> PromoterError {
    PromoterError::Http(err.to_string())
}

/// The `message` field of a JSON error body, or the trimmed body itself.
pub fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Map a non-success status to `Upstream`.
pub async fn check_status(response: reqwest::Response) -> PromoterResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PromoterError::Upstream {
        status: status.as_u16(),
        message: upstream_message(&body),
    })
}

/// GET a plain document.
pub async fn get_text(client: &reqwest::Client, url: &str) -> PromoterResult<String> {
    debug!(url = %url, "Fetching document");
    let response = client.get(url).send().await.map_err(transport)?;
    check_status(response).await?.text().await.map_err(transport)
}
