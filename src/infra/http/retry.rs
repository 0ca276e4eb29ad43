// Retry for idempotent-enough HTTP calls.
//
// Transport errors, 429 and 5xx responses are retried with a linear backoff.
// Whatever the last attempt produced (response or error) is handed back, so
// the caller still decides what a non-2xx status means.

use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

const BACKOFF_STEP: Duration = Duration::from_millis(500);

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Sends `request`, retrying up to `max_retries` extra times.
pub async fn send_with_retry(
    request: RequestBuilder,
    max_retries: u32,
) -> Result<Response, reqwest::Error> {
    let mut attempt: u32 = 0;
    loop {
        // Bodies we send are always in-memory JSON, so cloning only fails for
        // streams; in that case there is a single attempt.
        let Some(current) = request.try_clone() else {
            return request.send().await;
        };

        let result = current.send().await;
        let retry = match &result {
            Ok(response) => is_retryable_status(response.status()),
            Err(e) => is_retryable_error(e),
        };

        if !retry || attempt >= max_retries {
            return result;
        }

        attempt += 1;
        match &result {
            Ok(response) => tracing::warn!(
                "Request returned {}, retrying ({}/{})",
                response.status(),
                attempt,
                max_retries
            ),
            Err(e) => tracing::warn!("Request failed: {}, retrying ({}/{})", e, attempt, max_retries),
        }
        tokio::time::sleep(BACKOFF_STEP * attempt).await;
    }
}
