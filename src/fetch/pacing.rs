//! Minimum spacing between the start of two client calls

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Hands out call start slots at least `spacing` apart
///
/// Slots are reserved in arrival order, so concurrent workers queue up
/// behind each other instead of bursting.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    fn next_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.next_slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves the next slot and returns the instant it opens
    pub fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.spacing);
        slot
    }

    /// Waits for this caller's turn to start a call
    pub async fn wait(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let slot = self.reserve();
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_spaced_apart() {
        let pacer = RequestPacer::new(Duration::from_millis(50));
        let start = Instant::now();

        let first = pacer.reserve();
        let second = pacer.reserve();
        let third = pacer.reserve();

        assert_eq!(first - start, Duration::ZERO);
        assert_eq!(second - start, Duration::from_millis(50));
        assert_eq!(third - start, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pacer_does_not_delay() {
        let pacer = RequestPacer::new(Duration::from_millis(50));
        pacer.wait().await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let before = Instant::now();
        pacer.wait().await;
        assert_eq!(Instant::now(), before, "Slot should open immediately after a pause");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_start_in_sequence() {
        let pacer = RequestPacer::new(Duration::from_millis(20));
        let start = Instant::now();

        let started = futures::future::join_all((0..4).map(|_| async {
            pacer.wait().await;
            Instant::now() - start
        }))
        .await;

        assert_eq!(
            started,
            vec![
                Duration::ZERO,
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(60),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_spacing_never_waits() {
        let pacer = RequestPacer::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..10 {
            pacer.wait().await;
        }
        assert_eq!(Instant::now(), start);
    }
}
