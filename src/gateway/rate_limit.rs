//! Minimum-interval gate shared by every caller of one endpoint.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Enforces a minimum wall-clock spacing between consecutive calls.
///
/// The spacing is measured from the moment the previous caller was let
/// through, regardless of how that call ended. Waiters are served in FIFO
/// order because `tokio::sync::Mutex` is fair.
#[derive(Debug)]
pub struct MinIntervalGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinIntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the interval since the previous call has elapsed.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            if Instant::now() < ready_at {
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_call_passes_immediately() {
        let gate = MinIntervalGate::new(Duration::from_secs(1));
        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_calls_are_spaced() {
        let gate = MinIntervalGate::new(Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..4 {
            gate.wait().await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callers_are_not_delayed_further() {
        let gate = MinIntervalGate::new(Duration::from_millis(300));
        gate.wait().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let before = Instant::now();
        gate.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_share_one_gate() {
        let gate = Arc::new(MinIntervalGate::new(Duration::from_secs(1)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.wait().await;
                Instant::now()
            }));
        }
        let mut passed = Vec::new();
        for h in handles {
            passed.push(h.await.unwrap());
        }
        passed.sort();
        for pair in passed.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
