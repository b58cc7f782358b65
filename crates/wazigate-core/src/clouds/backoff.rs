// ── Retry backoff ──
//
// Fixed schedule shared by the REST and MQTT loops of a cloud.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Delays between consecutive failed attempts; the last one repeats.
pub const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(60),
];

#[derive(Debug, Default, Clone)]
pub struct Backoff {
    attempt: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = RETRY_SCHEDULE[self.attempt.min(RETRY_SCHEDULE.len() - 1)];
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Sleep for the next delay. Returns `false` if cancelled first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        info!(
            delay_secs = delay.as_secs(),
            attempt = self.attempt,
            "waiting before retry"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn schedule_saturates_at_sixty_seconds() {
        let mut backoff = Backoff::new();
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![secs(5), secs(10), secs(20), secs(60), secs(60), secs(60)]
        );
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), secs(5));
        assert_eq!(backoff.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_for_scheduled_delay() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new();

        let start = tokio::time::Instant::now();
        assert!(backoff.wait(&cancel).await);
        assert!(backoff.wait(&cancel).await);
        assert_eq!(start.elapsed(), secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_early_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut backoff = Backoff::new();
        let start = tokio::time::Instant::now();
        assert!(!backoff.wait(&cancel).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
