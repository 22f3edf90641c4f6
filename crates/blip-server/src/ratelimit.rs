use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::error::{Error, Result};
use crate::AppState;

pub const DEFAULT_PER_SEC: u32 = 2;
pub const DEFAULT_BURST: u32 = 5;

/// Per-client token buckets, keyed by IP address.
#[derive(Clone)]
pub struct ClientLimiter {
    inner: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl std::fmt::Debug for ClientLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLimiter")
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl ClientLimiter {
    /// `per_sec` tokens refill every second, up to `burst`. Zero is read as one.
    pub fn new(per_sec: u32, burst: u32) -> Self {
        let per_sec = NonZeroU32::new(per_sec).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_sec).allow_burst(burst);
        Self {
            inner: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Take one token for `ip`.
    pub fn check(&self, ip: IpAddr) -> Result<()> {
        self.inner.check_key(&ip).map_err(|_| Error::RateLimited)
    }

    /// Number of clients currently holding a bucket.
    pub fn tracked(&self) -> usize {
        self.inner.len()
    }

    /// Drop buckets that have refilled completely; they are
    /// indistinguishable from a fresh one.
    pub fn evict_idle(&self) {
        self.inner.retain_recent();
        self.inner.shrink_to_fit();
    }

    pub fn spawn_eviction(self, interval: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let before = self.tracked();
                self.evict_idle();
                debug!(before, after = self.tracked(), "evicted idle rate limit buckets");
            }
        });
    }
}

impl Default for ClientLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SEC, DEFAULT_BURST)
    }
}

/// The address a request is billed to. Forwarding headers are only
/// honoured behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: &SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }
    peer.ip()
}

/// Axum middleware that rejects clients over their quota with 429.
pub async fn limit_by_client(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), &peer, state.trust_proxy);
    match state.limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(%ip, "rate limited");
            e.into_response()
        }
    }
}
