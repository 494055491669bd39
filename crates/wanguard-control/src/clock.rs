//! Fixed-cadence tick driver.
//!
//! One [`TickClock`] drives one controller loop. Ticks land on fixed
//! monotonic boundaries so the α-calibrated EWMAs keep their time constants:
//! when a cycle overruns its slot, the driver skips to the next *future*
//! boundary and advances the tick counter by the number of missed intervals
//! rather than firing ticks back-to-back to catch up.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// One scheduling slot.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Monotonic tick number, counting skipped slots.
    pub number: u64,
    /// When this cycle's budget ends (the next boundary).
    pub deadline: Instant,
}

pub struct TickClock {
    interval: Duration,
    next_boundary: Instant,
    tick: u64,
    shutdown: watch::Receiver<bool>,
}

impl TickClock {
    pub fn new(interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        TickClock {
            interval,
            next_boundary: Instant::now() + interval,
            tick: 0,
            shutdown,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next boundary. Returns `None` once shutdown is
    /// requested, which ends the controller loop.
    pub async fn next_tick(&mut self) -> Option<Tick> {
        if *self.shutdown.borrow() {
            return None;
        }

        let now = Instant::now();
        if now >= self.next_boundary {
            // Previous cycle overran its slot: skip to the next future
            // boundary instead of firing a burst of catch-up ticks.
            let behind = now.duration_since(self.next_boundary);
            let missed = (behind.as_nanos() / self.interval.as_nanos()) as u64 + 1;
            tracing::warn!(
                missed,
                behind_ms = behind.as_millis() as u64,
                "cycle overran its slot, skipping ahead"
            );
            self.tick += missed;
            self.next_boundary += self.interval * missed as u32;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(self.next_boundary) => break,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return None;
                    }
                }
            }
        }

        let number = self.tick;
        self.tick += 1;
        self.next_boundary += self.interval;
        Some(Tick {
            number,
            deadline: self.next_boundary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(interval_ms: u64) -> (TickClock, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (TickClock::new(Duration::from_millis(interval_ms), rx), tx)
    }

    // ─── Cadence ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ticks_are_numbered_sequentially() {
        let (mut clock, _tx) = clock(50);
        for expected in 0..5 {
            let tick = clock.next_tick().await.unwrap();
            assert_eq!(tick.number, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_land_on_interval_boundaries() {
        let (mut clock, _tx) = clock(50);
        let start = Instant::now();
        clock.next_tick().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        clock.next_tick().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_the_next_boundary() {
        let (mut clock, _tx) = clock(50);
        let tick = clock.next_tick().await.unwrap();
        assert_eq!(
            tick.deadline.duration_since(Instant::now()),
            Duration::from_millis(50)
        );
    }

    // ─── Overrun ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn overrun_skips_to_future_boundary() {
        let (mut clock, _tx) = clock(50);
        clock.next_tick().await.unwrap(); // tick 0 at t=50ms

        // Simulate a cycle that ran 130 ms: two full slots missed.
        tokio::time::sleep(Duration::from_millis(130)).await;

        let start = Instant::now();
        let tick = clock.next_tick().await.unwrap();
        assert_eq!(tick.number, 3, "ticks 1 and 2 were skipped");
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(20),
            "fires on the next future boundary, not immediately"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_back_to_back_ticks_after_overrun() {
        let (mut clock, _tx) = clock(50);
        clock.next_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(75)).await;

        let before = Instant::now();
        clock.next_tick().await.unwrap();
        assert!(
            Instant::now() > before,
            "second tick must wait for a boundary"
        );
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_wait_returns_none() {
        let (mut clock, tx) = clock(50);
        tx.send(true).unwrap();
        assert!(clock.next_tick().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_wait_returns_none() {
        let (mut clock, tx) = clock(5_000);
        let waiter = tokio::spawn(async move { clock.next_tick().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sender_drop_acts_as_shutdown() {
        let (mut clock, tx) = clock(5_000);
        drop(tx);
        assert!(clock.next_tick().await.is_none());
    }
}
