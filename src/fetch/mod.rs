//! HTTP plumbing shared by the HTTP-speaking sources.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use reqwest::StatusCode;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// POSTs `body` to `url` and returns the response text.
///
/// Gateway errors map to [`PipelineError::Connection`] so they are retried,
/// any other non-success status to [`PipelineError::Query`].
pub async fn post_text<C: HttpClient + ?Sized>(client: &C, url: &str, body: String) -> Result<String> {
    let mut req = reqwest::Request::new(
        reqwest::Method::POST,
        url.parse()
            .map_err(|e| PipelineError::Config(format!("invalid URL {url}: {e}")))?,
    );
    debug!(bytes = body.len(), "POST query");
    *req.body_mut() = Some(body.into());

    let resp = client.execute(req).await?;
    let status = resp.status();
    let text = resp.text().await?;
    if status.is_success() {
        return Ok(text);
    }

    let message = format!("HTTP {status}: {}", text.trim());
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Err(PipelineError::Connection(message))
        }
        _ => Err(PipelineError::Query(message)),
    }
}
