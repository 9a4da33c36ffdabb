//! Fixed-rate pacing for the tick loop.

use log::debug;
use std::time::{Duration, Instant};

/// Hands out tick times on a monotonic clock and sleeps until the next tick
/// is due.
///
/// Sleeping goes through [`spin_sleep`], which is accurate to well under a
/// millisecond; the plain thread sleep is too coarse at 50 Hz on some
/// platforms.
#[derive(Debug)]
pub struct Pacer {
    origin: Instant,
    interval: Duration,
    next: Instant,
}

impl Pacer {
    /// A pacer whose clock starts now.
    pub fn new(interval: Duration) -> Self {
        let origin = Instant::now();
        Self {
            origin,
            interval,
            next: origin + interval,
        }
    }

    /// Seconds since the pacer was created.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Time between two ticks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next tick is due. A loop that fell more than a tick
    /// behind skips the missed ticks instead of bursting through them.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if let Some(remaining) = self.next.checked_duration_since(now) {
            spin_sleep::sleep(remaining);
            self.next += self.interval;
        } else {
            let behind = now - self.next;
            if behind > self.interval {
                debug!("Tick loop {:?} behind, skipping ahead", behind);
                self.next = now + self.interval;
            } else {
                self.next += self.interval;
            }
        }
    }
}
