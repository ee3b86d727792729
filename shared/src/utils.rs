//! Utility helpers shared by the manager and worker binaries

use anyhow::{Context, Result};
use std::time::Duration;

/// Attempts made by [`http_get_with_retry`] before giving up.
pub const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Exponential backoff delay for the given zero-based attempt.
pub fn backoff_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10)));
    delay.min(max_delay_ms)
}

/// GET with bounded retry.
///
/// Transient transport failures are retried with exponential backoff; the
/// last error is returned once the attempts are exhausted. A response with
/// any status counts as success here: status handling belongs to the caller.
pub async fn http_get_with_retry(
    client: &reqwest::Client,
    url: &str,
) -> Result<reqwest::Response> {
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match client.get(url).send().await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                tracing::debug!(url = %url, attempt, error = %e, "GET failed, will retry");
                last_err = Some(e);
            }
        }
        if attempt + 1 < RETRY_ATTEMPTS {
            let delay = backoff_delay_ms(attempt, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
    Err(last_err.expect("at least one attempt was made"))
        .with_context(|| format!("GET {} failed after {} attempts", url, RETRY_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0, 250, 5_000), 250);
        assert_eq!(backoff_delay_ms(1, 250, 5_000), 500);
        assert_eq!(backoff_delay_ms(2, 250, 5_000), 1_000);
        assert_eq!(backoff_delay_ms(10, 250, 5_000), 5_000);
        // The exponent is clamped, so huge attempts do not overflow.
        assert_eq!(backoff_delay_ms(u32::MAX, 250, 5_000), 5_000);
    }

    #[tokio::test]
    async fn test_retry_exhausts_on_refused_connection() {
        // Port 1 on localhost is essentially never listening.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let start = std::time::Instant::now();
        let result = http_get_with_retry(&client, "http://127.0.0.1:1/stats").await;
        assert!(result.is_err());
        // Three backoff sleeps happened between the four attempts.
        assert!(start.elapsed() >= Duration::from_millis(250 + 500 + 1000));
    }
}
