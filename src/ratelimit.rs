use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_calls` acquisitions complete within any
/// window of length `period`.
///
/// Waiters queue on a fair mutex, so they are served in arrival order. A caller that
/// holds the lock sleeps until the oldest slot in the window expires.
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            period,
            window: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for a free slot. Never fails.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = window.front() {
                if now.duration_since(oldest) >= self.period {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if window.len() < self.max_calls {
                window.push_back(now);
                return;
            }

            if let Some(&oldest) = window.front() {
                tokio::time::sleep_until(oldest + self.period).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_burst_within_budget_does_not_wait() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_excess_call_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(150));
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_shared_budget_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_millis(60)));
        let start = std::time::Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        // four acquisitions at one per 60ms need at least three full periods
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn test_zero_max_calls_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_calls(), 1);
    }
}
