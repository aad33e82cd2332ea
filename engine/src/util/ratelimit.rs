//! Global rate limiter: sliding-window QPS plus a concurrency semaphore,
//! acquired in that order (QPS budget first, then a concurrency permit) so a
//! burst of ready work never exceeds either bound.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

struct SlidingWindow {
    events: VecDeque<Instant>,
    rate: usize,
    per: Duration,
}

impl SlidingWindow {
    fn new(rate: usize, per: Duration) -> Self {
        SlidingWindow {
            events: VecDeque::new(),
            rate: rate.max(1),
            per,
        }
    }
}

/// Composite rate limiter: acquire order is QPS first, then a concurrency
/// slot; release in reverse. Exposes a scoped RAII guard ("slot").
pub struct GlobalRateLimiter {
    window: Mutex<SlidingWindow>,
    concurrency: Arc<Semaphore>,
}

impl GlobalRateLimiter {
    pub fn new(max_concurrent: usize, qps: usize, burst_window: Duration) -> Self {
        GlobalRateLimiter {
            window: Mutex::new(SlidingWindow::new(qps, burst_window)),
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Acquire a slot: block until both the sliding-window QPS budget has
    /// room and a concurrency permit is available.
    pub async fn slot(&self) -> RateLimiterSlot {
        loop {
            let sleep_for = {
                let mut w = self.window.lock().await;
                let now = Instant::now();
                while let Some(front) = w.events.front() {
                    if now.duration_since(*front) > w.per {
                        w.events.pop_front();
                    } else {
                        break;
                    }
                }
                if w.events.len() < w.rate {
                    w.events.push_back(now);
                    None
                } else {
                    let oldest = *w.events.front().unwrap();
                    Some(w.per.saturating_sub(now.duration_since(oldest)))
                }
            };
            match sleep_for {
                None => break,
                Some(d) => tokio::time::sleep(d).await,
            }
        }

        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        RateLimiterSlot { _permit: permit }
    }
}

/// RAII guard; releasing the concurrency permit happens on drop.
pub struct RateLimiterSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrency_bounds_simultaneous_holders() {
        let limiter = Arc::new(GlobalRateLimiter::new(2, 1000, Duration::from_secs(1)));
        let active = Arc::new(tokio::sync::Mutex::new(0usize));
        let max_seen = Arc::new(tokio::sync::Mutex::new(0usize));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _slot = limiter.slot().await;
                {
                    let mut a = active.lock().await;
                    *a += 1;
                    let mut m = max_seen.lock().await;
                    *m = (*m).max(*a);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                {
                    let mut a = active.lock().await;
                    *a -= 1;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(*max_seen.lock().await <= 2);
    }

    #[tokio::test]
    async fn qps_window_delays_bursts_past_the_limit() {
        let limiter = GlobalRateLimiter::new(10, 2, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..3 {
            let _slot = limiter.slot().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
