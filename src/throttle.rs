//! Paces outbound calls behind a randomized minimum-interval gate.
//!
//! The chat endpoint rate-limits aggressively and opaquely; a fixed interval
//! is easy to fingerprint, so each call samples a fresh interval from
//! `[min_interval, max_interval)`.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct Throttler {
    min_interval: Duration,
    max_interval: Duration,
    last_execution: Mutex<Option<Instant>>,
}

impl Throttler {
    /// Panics if `min_interval > max_interval`; that is a configuration bug.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        assert!(
            min_interval <= max_interval,
            "min_interval must not exceed max_interval"
        );

        Self {
            min_interval,
            max_interval,
            last_execution: Mutex::new(None),
        }
    }

    /// Run `f` behind the gate. Holds the gate for the whole call, so
    /// concurrent callers are serialized and consecutive executions are at
    /// least one sampled interval apart.
    ///
    /// When throttled, this sleeps the full sampled interval rather than the
    /// remaining gap. That over-waits under bursty load; kept deliberately.
    pub async fn run<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last = self.last_execution.lock().await;

        let jitter = {
            use rand::Rng;
            let span = (self.max_interval - self.min_interval).as_secs_f64();
            rand::thread_rng().gen_range(0.0..=1.0) * span
        };
        let interval = self.min_interval + Duration::from_secs_f64(jitter);

        if let Some(at) = *last {
            if at.elapsed() < interval {
                tokio::time::sleep(interval).await;
            }
        }

        let result = f().await;
        *last = Some(Instant::now());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_call_runs_immediately() {
        let throttler = Throttler::new(Duration::from_millis(100), Duration::from_millis(200));

        let start = Instant::now();
        let result = throttler.run(|| async { Ok(42) }).await.unwrap();

        assert_eq!(result, 42);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_back_to_back_calls_are_spaced() {
        let throttler = Throttler::new(Duration::from_millis(100), Duration::from_millis(150));

        let start = Instant::now();
        throttler.run(|| async { Ok(()) }).await.unwrap();
        throttler.run(|| async { Ok(()) }).await.unwrap();
        throttler.run(|| async { Ok(()) }).await.unwrap();
        let elapsed = start.elapsed();

        // Two throttled calls, each at least min_interval apart.
        assert!(
            elapsed >= Duration::from_millis(200),
            "expected at least 200ms across three calls, got {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_error_still_updates_gate() {
        let throttler = Throttler::new(Duration::from_millis(100), Duration::from_millis(120));

        let err: anyhow::Result<()> = throttler
            .run(|| async { Err(anyhow::anyhow!("send failed")) })
            .await;
        assert!(err.is_err());

        // The failed call still counts as an execution.
        let start = Instant::now();
        throttler.run(|| async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    #[should_panic]
    fn test_inverted_interval_panics() {
        let _ = Throttler::new(Duration::from_millis(200), Duration::from_millis(100));
    }
}
