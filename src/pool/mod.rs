//! WarmPool reconciler (C3, spec.md §4.3).

pub mod placement;
pub mod reconciler;

pub use reconciler::run;

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A per-controller token bucket bounding enqueue rate (spec.md §4.3
/// "Rate limiting", §5). Not grounded in any single pack crate — the
/// teacher and the rest of the pack have no rate limiter of their own —
/// so this is a small hand-rolled primitive sized to exactly the
/// QPS/burst knobs spec.md names, rather than pulling in a crate for a
/// dozen lines of logic.
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
    qps: f64,
    burst: f64,
}

struct RateLimiterState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            qps,
            burst: burst as f64,
        }
    }

    /// Block until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
