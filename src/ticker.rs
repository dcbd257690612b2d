//! Clock abstraction and the cancellable periodic task that drives VAD.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};

/// ~60 Hz, one evaluation per display frame.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Periodic task with explicit start/stop.
///
/// While stopped, `tick()` never resolves, so it can sit in a `select!`
/// guarded by `is_running()`.
pub struct Ticker {
    period: Duration,
    clock: Arc<dyn Clock>,
    interval: Option<Interval>,
}

impl Ticker {
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            period,
            clock,
            interval: None,
        }
    }

    pub fn start(&mut self) {
        if self.interval.is_some() {
            return;
        }
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
        log::debug!("[ticker] started ({}ms)", self.period.as_millis());
    }

    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            log::debug!("[ticker] stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next tick and returns the clock reading at that moment.
    pub async fn tick(&mut self) -> u64 {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
                self.clock.now_ms()
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.advance(250), 250);
        clock.set(1_000);
        assert_eq!(clock.now_ms(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_only_while_running() {
        let clock = ManualClock::new();
        let mut ticker = Ticker::new(FRAME_INTERVAL, Arc::new(clock.clone()));
        assert!(!ticker.is_running());

        let idle = tokio::time::timeout(Duration::from_millis(100), ticker.tick()).await;
        assert!(idle.is_err());

        ticker.start();
        clock.set(42);
        assert_eq!(ticker.tick().await, 42);
        clock.set(58);
        assert_eq!(ticker.tick().await, 58);

        ticker.stop();
        assert!(!ticker.is_running());
        let stopped = tokio::time::timeout(Duration::from_millis(100), ticker.tick()).await;
        assert!(stopped.is_err());
    }
}
