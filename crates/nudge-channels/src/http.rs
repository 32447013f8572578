//! Response classification shared by the HTTP transports.

use nudge_core::traits::SendOutcome;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;

/// Map an HTTP response to a send outcome.
/// `throttle_codes` are provider error codes (at `/error/code`) that mean
/// "slow down" even without a 429 status.
pub(crate) async fn classify(
    channel: &str,
    response: reqwest::Response,
    throttle_codes: &[i64],
) -> SendOutcome {
    let status = response.status();
    if status.is_success() {
        return SendOutcome::Delivered;
    }

    let header_retry = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let json: Option<serde_json::Value> = serde_json::from_str(&body).ok();

    let provider_code = json
        .as_ref()
        .and_then(|j| j.pointer("/error/code"))
        .and_then(|c| c.as_i64());
    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || provider_code.is_some_and(|c| throttle_codes.contains(&c));

    if throttled {
        // Telegram puts the hint in the body instead of the header.
        let retry_after_secs = header_retry.or_else(|| {
            json.as_ref()
                .and_then(|j| j.pointer("/parameters/retry_after"))
                .and_then(|v| v.as_u64())
        });
        tracing::warn!("🐢 {} throttled (retry after {:?}s)", channel, retry_after_secs);
        return SendOutcome::RateLimited { retry_after_secs };
    }

    SendOutcome::Error(format!("{channel} API error {status}: {}", truncate(&body, 300)))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
