//! Rate control for the traffic generators.
//!
//! Two independent mechanisms:
//!
//! - [`Pacer`]: a per-worker periodic timer firing at the batch tick rate.
//! - [`Limiter`]: an optional global rate cap shared by all workers. The
//!   open-loop wait is cancelled by the run's [`DoneSignal`].

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Create the run-wide done signal and the trigger that fires it.
pub fn done_signal() -> (DoneTrigger, DoneSignal) {
    let (tx, rx) = watch::channel(false);
    (DoneTrigger { tx }, DoneSignal { rx })
}

/// Fires the done signal. Firing is idempotent.
#[derive(Debug)]
pub struct DoneTrigger {
    tx: watch::Sender<bool>,
}

impl DoneTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of the done signal; cheap to clone into every worker.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the run is over. A dropped trigger also counts as over.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Periodic tick at `tick_rate` per second.
pub struct Pacer {
    interval: Interval,
}

impl Pacer {
    /// The first tick fires one period after creation. Late ticks are
    /// skipped rather than bunched.
    pub fn new(tick_rate: u32) -> Self {
        let period = Self::period(tick_rate);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(tick_rate: u32) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)))
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Optional global cap on sends per second, shared by every worker.
///
/// Backed by a direct `governor` limiter with a one-second burst. A cap of
/// `None` (or zero) makes every wait a pass-through.
#[derive(Clone, Default)]
pub struct Limiter {
    inner: Option<Arc<DirectLimiter>>,
    // Largest single request the quota admits: one second of sends.
    burst: Option<NonZeroU32>,
}

impl Limiter {
    pub fn new(limit: Option<u32>) -> Self {
        let burst = limit.and_then(NonZeroU32::new);
        Self {
            inner: burst.map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate)))),
            burst,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    /// Wait until `n` sends are allowed. Requests above the burst are
    /// clamped to the burst.
    pub async fn wait(&self, n: u32) {
        let (Some(limiter), Some(burst)) = (&self.inner, self.burst) else {
            return;
        };
        let Some(n) = NonZeroU32::new(n) else {
            return;
        };
        // Never above the burst, so the capacity check cannot fail.
        let _ = limiter.until_n_ready(n.min(burst)).await;
    }

    /// Like [`Limiter::wait`], but gives up when the run ends.
    ///
    /// Returns `false` if the done signal fired before or during the wait.
    pub async fn acquire(&self, n: u32, done: &mut DoneSignal) -> bool {
        if done.is_done() {
            return false;
        }
        if !self.is_limited() {
            return true;
        }
        tokio::select! {
            _ = self.wait(n) => !done.is_done(),
            _ = done.wait() => false,
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter").field("burst", &self.burst).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_done_signal_wakes_waiters() {
        let (trigger, mut signal) = done_signal();
        assert!(!signal.is_done());

        let mut waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        trigger.fire();
        trigger.fire();
        task.await.unwrap();

        assert!(signal.is_done());
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_wait() {
        let (trigger, mut signal) = done_signal();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_pacer_period() {
        assert_eq!(Pacer::period(1), Duration::from_secs(1));
        assert_eq!(Pacer::period(4), Duration::from_millis(250));
        assert_eq!(Pacer::period(0), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_ticks_at_rate() {
        let mut pacer = Pacer::new(10);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.tick().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_limiter_burst_then_waits() {
        let limiter = Limiter::new(Some(100));
        assert!(limiter.is_limited());

        let start = Instant::now();
        limiter.wait(100).await;
        assert!(start.elapsed() < Duration::from_millis(100));

        // bucket is empty: 50 more need half a second
        limiter.wait(50).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_limiter_clamps_request_to_burst() {
        let limiter = Limiter::new(Some(10));
        let start = Instant::now();
        limiter.wait(1000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_cancelled_by_done() {
        let limiter = Limiter::new(Some(1));
        let (trigger, mut signal) = done_signal();
        assert!(limiter.acquire(1, &mut signal).await);

        let mut waiter = signal.clone();
        let task = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(1, &mut waiter).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.fire();

        let cancelled = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn test_unlimited_limiter_passes_through() {
        let (trigger, mut signal) = done_signal();
        let limiter = Limiter::new(None);
        assert!(!limiter.is_limited());
        assert!(limiter.acquire(1_000_000, &mut signal).await);

        trigger.fire();
        assert!(!limiter.acquire(1, &mut signal).await);
        assert!(!Limiter::new(Some(0)).is_limited());
    }
}
