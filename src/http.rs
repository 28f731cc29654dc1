//! JSON-over-HTTP with retry, shared by the LLM and embedding providers.
//!
//! Retry strategy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpFailure {
    #[error("{label} API error {status}: {body}")]
    Status {
        label: &'static str,
        status: u16,
        body: String,
    },
    #[error("{label} connection error: {message}")]
    Transport { label: &'static str, message: String },
    #[error("{label} returned invalid JSON: {message}")]
    Decode { label: &'static str, message: String },
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// POST `body` to `url`, retrying transient failures up to `max_retries` times.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    max_retries: u32,
    label: &'static str,
) -> Result<Value, HttpFailure> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| HttpFailure::Decode {
                        label,
                        message: e.to_string(),
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let failure = HttpFailure::Status {
                    label,
                    status: status.as_u16(),
                    body: body_text,
                };
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(attempt, status = status.as_u16(), "{} request will be retried", label);
                    last_err = Some(failure);
                    continue;
                }
                return Err(failure);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "{} request failed", label);
                last_err = Some(HttpFailure::Transport {
                    label,
                    message: e.to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or(HttpFailure::Transport {
        label,
        message: "no attempts were made".to_string(),
    }))
}
