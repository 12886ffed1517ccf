//! Per-client rate limiting (§5): a keyed token bucket, one bucket per
//! source IP, applied as middleware to the mutating API routes.
//!
//! The teacher's own `governor` usage (`acoustid_client.rs`,
//! `musicbrainz_client.rs`) is a single `RateLimiter::direct` bucket
//! throttling outbound calls to a third party. That shape doesn't fit
//! here: this limiter throttles inbound requests per caller, so it
//! needs the keyed variant of the same crate instead.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::AppState;

pub struct ClientRateLimiter {
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
}

impl ClientRateLimiter {
    /// `requests` tokens replenished over `window_secs`, per the
    /// deployment's `RATE_LIMIT_REQUESTS`/`RATE_LIMIT_WINDOW` settings.
    pub fn new(requests: u32, window_secs: u64) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::new(1).unwrap());
        let per_window = std::time::Duration::from_secs(window_secs.max(1));
        let quota = Quota::with_period(per_window / requests.get())
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(requests);
        Self { limiter: RateLimiter::keyed(quota) }
    }

    pub fn check(&self, addr: IpAddr) -> bool {
        self.limiter.check_key(&addr).is_ok()
    }
}

/// Axum middleware applied only to the API routes named in §5; `/health`
/// and the WebSocket upgrade route are mounted outside its layer.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if state.rate_limiter.check(addr.ip()) {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": { "code": "rate_limited", "message": "Too many requests, slow down." }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_quota_and_blocks_the_next() {
        let limiter = ClientRateLimiter::new(2, 60);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn buckets_are_independent_per_client() {
        let limiter = ClientRateLimiter::new(1, 60);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
