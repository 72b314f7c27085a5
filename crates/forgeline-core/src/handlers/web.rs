//! HTTP fetch.

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::{CapabilityHandler, CapabilityOutcome, ExecutionContext};

const MAX_BODY_CHARS: usize = 100_000;

/// `web_fetch { url }`: HTTP GET, body returned as text.
#[derive(Debug, Clone)]
pub struct WebFetchHandler {
    client: reqwest::Client,
}

impl WebFetchHandler {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("forgeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CapabilityHandler for WebFetchHandler {
    async fn execute(
        &self,
        arguments: &Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let Some(url) = arguments.get("url").and_then(Value::as_str) else {
            return Ok(CapabilityOutcome::failure("argument 'url' must be a string"));
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(CapabilityOutcome::failure(format!(
                "unsupported url '{url}': only http and https are fetched"
            )));
        }

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(CapabilityOutcome::failure(format!("request to {url} timed out")))
            }
            Err(e) => return Ok(CapabilityOutcome::failure(format!("request to {url} failed: {e}"))),
        };
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(CapabilityOutcome::failure(format!("resource does not exist: {url} (404)")));
        }
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(CapabilityOutcome::failure(format!("permission denied: {url} ({status})")));
        }
        if !status.is_success() {
            return Ok(CapabilityOutcome::failure(format!("GET {url} returned {status}")));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(CapabilityOutcome::failure(format!("reading body of {url} failed: {e}"))),
        };
        let body = if body.chars().count() > MAX_BODY_CHARS {
            let mut truncated: String = body.chars().take(MAX_BODY_CHARS).collect();
            truncated.push_str("\n[truncated]");
            truncated
        } else {
            body
        };
        Ok(CapabilityOutcome::success(body))
    }
}
