use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::sleep;
use tracing::warn;

use crate::error::SyncError;

const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: usize) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt as u32)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Sends the request, retrying transient failures (429, 5xx, transport
/// errors) with exponential backoff. Success and permanent failures return
/// the response immediately; the wrapper has no opinion about what request
/// it is retrying, so the token exchange and mailbox calls share it.
pub async fn fetch_with_retry(
    request: RequestBuilder,
    policy: &RetryPolicy,
) -> Result<Response, SyncError> {
    let mut attempt = 0usize;

    loop {
        let Some(builder) = request.try_clone() else {
            // streaming bodies cannot be replayed
            return Ok(request.send().await?);
        };

        match builder.send().await {
            Ok(response) if is_transient(response.status()) => {
                let status = response.status();
                attempt += 1;
                if attempt >= policy.max_attempts {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SyncError::UpstreamUnavailable {
                        status: status.as_u16(),
                        body: redact_response_body(&body),
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(status = status.as_u16(), attempt, ?delay, "transient upstream failure, backing off");
                sleep(delay).await;
            }
            Ok(response) => return Ok(response),
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(SyncError::Transport(error));
                }
                let delay = policy.delay_for(attempt);
                warn!(error = %error, attempt, ?delay, "transport failure, backing off");
                sleep(delay).await;
            }
        }
    }
}

/// Upstream error bodies can echo tokens or message content; cap what ends
/// up in error strings and logs.
pub fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < REDACTED_BODY_MAX_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}
