//! Retry, rate-limit and id parsing helpers shared by the Discord client.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

const MAX_RETRY_DELAY_MS: u64 = 30_000;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Reads `Retry-After` as (possibly fractional) seconds.
pub(super) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    parse_seconds(raw)
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    seconds_to_retry_after(raw.trim().parse::<f64>().ok()?)
}

/// Negative and non-finite hints are dropped; oversized ones are capped.
fn seconds_to_retry_after(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(MAX_RETRY_AFTER)
            .min(MAX_RETRY_AFTER),
    )
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

/// Retry hint of a 429 response. Discord puts the precise value in the JSON
/// body; the header is the fallback.
pub(super) fn rate_limit_retry_after(
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> Option<Duration> {
    serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .and_then(|parsed| parsed.retry_after)
        .and_then(seconds_to_retry_after)
        .or_else(|| parse_retry_after(headers))
}

pub(super) fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(MAX_RETRY_DELAY_MS))
}

pub(super) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

pub(super) fn is_retryable_discord_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub(super) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

/// Discord sends snowflakes as decimal strings.
pub(super) fn parse_snowflake(field: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| anyhow!("invalid discord snowflake for {field}: '{raw}'"))
}
