// =============================================================================
// Worker Coordinator (C2) — budget arbitration above the rate limiter
// =============================================================================
//
// Divides the limiter's effective budget between worker classes so that a
// burst from the scanner can't starve the trading engine's account calls.
// Sits strictly above C1: every admitted request still calls
// `RateLimiter::acquire`, this layer only decides whether to make the
// caller wait first.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::rate_limiter::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerClass {
    Trading,
    Scanner,
    Analysis,
}

impl WorkerClass {
    fn priority_backoff_ms(self) -> u64 {
        match self {
            Self::Trading => 100,
            Self::Scanner => 200,
            Self::Analysis => 500,
        }
    }

    fn budget_fraction(self) -> f64 {
        match self {
            Self::Trading => 0.40,
            Self::Scanner => 0.40,
            Self::Analysis => 0.20,
        }
    }
}

struct WorkerRecord {
    class: WorkerClass,
    requests_in_window: VecDeque<Instant>,
}

const BUDGET_WINDOW: Duration = Duration::from_secs(10);

pub struct WorkerCoordinator {
    effective_limit: f64,
    workers: Mutex<HashMap<u64, WorkerRecord>>,
}

impl WorkerCoordinator {
    pub fn new(effective_limit: f64) -> Self {
        Self {
            effective_limit,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, worker_id: u64, class: WorkerClass) {
        self.workers.lock().insert(
            worker_id,
            WorkerRecord { class, requests_in_window: VecDeque::new() },
        );
    }

    pub fn unregister(&self, worker_id: u64) {
        self.workers.lock().remove(&worker_id);
    }

    /// Waits out a priority-scaled backoff if `worker_id` has exceeded its
    /// class's share of the budget over the last 10s window, then records
    /// the request. Does not call [`crate::rate_limiter::RateLimiter`]
    /// itself — callers still must acquire from C1 afterward.
    pub async fn request_permission(&self, worker_id: u64, _category: Category) {
        let backoff = {
            let mut workers = self.workers.lock();
            let Some(record) = workers.get_mut(&worker_id) else {
                return;
            };
            let now = Instant::now();
            while let Some(&oldest) = record.requests_in_window.front() {
                if now.duration_since(oldest) >= BUDGET_WINDOW {
                    record.requests_in_window.pop_front();
                } else {
                    break;
                }
            }
            let class_budget = self.effective_limit * record.class.budget_fraction();
            let over_budget = record.requests_in_window.len() as f64 >= class_budget;
            record.requests_in_window.push_back(now);
            if over_budget {
                let base = record.class.priority_backoff_ms();
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                Some(Duration::from_secs_f64(base as f64 * jitter / 1000.0))
            } else {
                None
            }
        };
        if let Some(backoff) = backoff {
            debug!(worker_id, backoff_ms = backoff.as_millis(), "worker coordinator backoff");
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_fractions_sum_to_one() {
        let total = WorkerClass::Trading.budget_fraction()
            + WorkerClass::Scanner.budget_fraction()
            + WorkerClass::Analysis.budget_fraction();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn over_budget_worker_is_delayed() {
        let coordinator = WorkerCoordinator::new(10.0);
        coordinator.register(1, WorkerClass::Analysis);
        // analysis budget = 10*0.2 = 2; third request in-window should back off.
        let start = Instant::now();
        for _ in 0..3 {
            coordinator.request_permission(1, Category::MarketData).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn unregistered_worker_never_blocks() {
        let coordinator = WorkerCoordinator::new(10.0);
        let start = Instant::now();
        coordinator.request_permission(99, Category::Account).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
