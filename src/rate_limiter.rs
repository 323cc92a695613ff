// =============================================================================
// Rate Limiter (C1) — per-category sliding-window admission
// =============================================================================
//
// Each category (`market_data`, `account`) tracks a deque of recent request
// timestamps and a dynamic delay that grows on rate-limit hits and decays
// after a run of successes. `acquire` computes how long the caller must wait
// before it is safe to send, then records the slot itself — callers don't
// need a separate "commit" step, matching the source's combined
// wait-then-send loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimitCategory;

const MIN_SPACING: Duration = Duration::from_millis(5);
const SUCCESS_STREAK_FOR_DECAY: u32 = 3;
const DYNAMIC_DELAY_DECAY: f64 = 0.8;
const DYNAMIC_DELAY_PENALTY_MS: f64 = 50.0;
const DYNAMIC_DELAY_CAP_MS: f64 = 500.0;

struct CategoryState {
    limits: RateLimitCategory,
    window: VecDeque<Instant>,
    dynamic_delay: Duration,
    consecutive_successes: u32,
}

impl CategoryState {
    fn new(limits: RateLimitCategory) -> Self {
        Self {
            limits,
            window: VecDeque::new(),
            dynamic_delay: Duration::ZERO,
            consecutive_successes: 0,
        }
    }

    fn effective_limit(&self) -> f64 {
        self.limits.max_requests as f64 * self.limits.safety_factor
    }

    fn evict_expired(&mut self, now: Instant) {
        let window = Duration::from_secs(self.limits.window_seconds);
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the wait the caller should honor before sending, and reserves
    /// the slot (pushes `now` into the window) so concurrent callers see an
    /// updated count immediately.
    fn acquire(&mut self, now: Instant) -> Duration {
        self.evict_expired(now);

        let effective = self.effective_limit();
        let count = self.window.len() as f64;
        let window_secs = self.limits.window_seconds as f64;

        let wait = if count < effective {
            let ideal_interval = Duration::from_secs_f64(window_secs / effective.max(1.0));
            (ideal_interval + self.dynamic_delay).max(MIN_SPACING)
        } else {
            let oldest = *self.window.front().expect("count>=effective>0 implies non-empty");
            let elapsed = now.duration_since(oldest);
            let window = Duration::from_secs(self.limits.window_seconds);
            let remaining = window.saturating_sub(elapsed);
            remaining + Duration::from_millis(100)
        };

        self.window.push_back(now);
        wait
    }

    fn record_success(&mut self) {
        self.consecutive_successes += 1;
        if self.consecutive_successes >= SUCCESS_STREAK_FOR_DECAY {
            let decayed = self.dynamic_delay.as_secs_f64() * DYNAMIC_DELAY_DECAY;
            self.dynamic_delay = Duration::from_secs_f64(decayed);
            self.consecutive_successes = 0;
        }
    }

    fn record_rate_limited(&mut self) {
        self.consecutive_successes = 0;
        let bumped = (self.dynamic_delay.as_secs_f64() * 1000.0 + DYNAMIC_DELAY_PENALTY_MS)
            .min(DYNAMIC_DELAY_CAP_MS);
        self.dynamic_delay = Duration::from_secs_f64(bumped / 1000.0);
    }

    fn stats(&self, now: Instant) -> CategoryStats {
        let mut window = self.window.clone();
        let bound = Duration::from_secs(self.limits.window_seconds);
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= bound {
                window.pop_front();
            } else {
                break;
            }
        }
        CategoryStats {
            requests_in_window: window.len(),
            utilization: window.len() as f64 / self.effective_limit().max(1.0),
            dynamic_delay_ms: self.dynamic_delay.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CategoryStats {
    pub requests_in_window: usize,
    pub utilization: f64,
    pub dynamic_delay_ms: f64,
}

/// Request category; the exchange client tags every call with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    MarketData,
    Account,
}

pub struct RateLimiter {
    market_data: Mutex<CategoryState>,
    account: Mutex<CategoryState>,
}

impl RateLimiter {
    pub fn new(market_data: RateLimitCategory, account: RateLimitCategory) -> Self {
        Self {
            market_data: Mutex::new(CategoryState::new(market_data)),
            account: Mutex::new(CategoryState::new(account)),
        }
    }

    fn state(&self, category: Category) -> &Mutex<CategoryState> {
        match category {
            Category::MarketData => &self.market_data,
            Category::Account => &self.account,
        }
    }

    /// Blocks the calling task until a slot opens for `category`, then
    /// reserves it. Safe under concurrent callers: the slot reservation
    /// happens under the category's lock before the sleep.
    pub async fn acquire(&self, category: Category) {
        let wait = {
            let mut state = self.state(category).lock();
            state.acquire(Instant::now())
        };
        if wait > Duration::ZERO {
            debug!(?category, wait_ms = wait.as_millis(), "rate limiter pacing");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn record_success(&self, category: Category) {
        self.state(category).lock().record_success();
    }

    pub fn record_rate_limited(&self, category: Category) {
        warn!(?category, "rate limit hit recorded");
        self.state(category).lock().record_rate_limited();
    }

    pub fn stats(&self, category: Category) -> CategoryStats {
        self.state(category).lock().stats(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(max_requests: u32, window_seconds: u64, safety_factor: f64) -> RateLimitCategory {
        RateLimitCategory { max_requests, window_seconds, safety_factor }
    }

    #[tokio::test]
    async fn bounded_within_window() {
        let limiter = RateLimiter::new(cat(10, 1, 0.9), cat(100, 10, 0.9));
        let start = Instant::now();
        for _ in 0..15 {
            limiter.acquire(Category::MarketData).await;
        }
        // effective limit = 9; acquiring 15 in a 1s window should have paced
        // the overflow, meaning it necessarily took some nonzero time.
        assert!(start.elapsed() > Duration::from_millis(1));
    }

    #[test]
    fn success_streak_decays_dynamic_delay() {
        let mut state = CategoryState::new(cat(100, 10, 0.9));
        state.dynamic_delay = Duration::from_millis(100);
        state.record_success();
        state.record_success();
        assert_eq!(state.dynamic_delay, Duration::from_millis(100));
        state.record_success();
        assert!(state.dynamic_delay < Duration::from_millis(100));
    }

    #[test]
    fn rate_limited_resets_streak_and_bumps_delay() {
        let mut state = CategoryState::new(cat(100, 10, 0.9));
        state.consecutive_successes = 2;
        state.record_rate_limited();
        assert_eq!(state.consecutive_successes, 0);
        assert_eq!(state.dynamic_delay, Duration::from_millis(50));
    }

    #[test]
    fn dynamic_delay_caps_at_500ms() {
        let mut state = CategoryState::new(cat(100, 10, 0.9));
        for _ in 0..20 {
            state.record_rate_limited();
        }
        assert!(state.dynamic_delay <= Duration::from_millis(500));
    }

    #[test]
    fn min_spacing_enforced_under_low_utilization() {
        let mut state = CategoryState::new(cat(1_000_000, 10, 0.9));
        let wait = state.acquire(Instant::now());
        assert!(wait >= MIN_SPACING);
    }
}
