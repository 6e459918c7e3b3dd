use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::AppError;
use crate::state::{AppState, RateLimitBucket};

/// Window duration in seconds; tokens refill fully after this period.
const WINDOW_SECS: u64 = 60;

/// Token-bucket rate limiter for producer endpoints, keyed by a hash of the
/// publish key (or Authorization header).
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = req
        .headers()
        .get("X-Publish-Key")
        .or_else(|| req.headers().get("Authorization"))
        .and_then(|v| v.to_str().ok())
        .map(|secret| {
            let mut hasher = Sha256::new();
            hasher.update(secret.as_bytes());
            format!("key:{:x}", hasher.finalize())
        })
        .unwrap_or_else(|| "anon".to_string());

    let capacity = state.config.publish_rate_limit.max(1);
    let now = Instant::now();

    let outcome = {
        let mut entry = state
            .rate_limits
            .entry(key)
            .or_insert_with(|| RateLimitBucket {
                remaining: capacity,
                last_refill: now,
            });
        take(entry.value_mut(), capacity, now)
    };

    let remaining = match outcome {
        Ok(remaining) => remaining,
        Err(retry_after) => return AppError::RateLimited { retry_after }.into_response(),
    };

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(capacity));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    response
}

/// Refill by elapsed time, then take one token. `Err` carries the seconds
/// until the bucket has tokens again.
fn take(bucket: &mut RateLimitBucket, capacity: u32, now: Instant) -> Result<u32, u64> {
    let elapsed = now.duration_since(bucket.last_refill).as_secs();
    if elapsed >= WINDOW_SECS {
        bucket.remaining = capacity;
        bucket.last_refill = now;
    } else if elapsed > 0 {
        let refill = ((elapsed as f64 / WINDOW_SECS as f64) * capacity as f64) as u32;
        if refill > 0 {
            bucket.remaining = (bucket.remaining + refill).min(capacity);
            bucket.last_refill = now;
        }
    }

    if bucket.remaining == 0 {
        let secs_until_refill =
            WINDOW_SECS.saturating_sub(now.duration_since(bucket.last_refill).as_secs());
        Err(secs_until_refill.max(1))
    } else {
        bucket.remaining -= 1;
        Ok(bucket.remaining)
    }
}
