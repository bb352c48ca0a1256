use std::thread;
use std::time::{Duration, Instant};

/// Below this, sleeping overshoots; spin instead
const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

/// Enforces the inter-send delay between consecutive frames.
///
/// The first `acquire` never waits, so a single send is unaffected by the
/// configured interval.
pub struct SendPacer {
    interval: Duration,
    last_send: Option<Instant>,
}

impl SendPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    /// Time left before the next send may go out
    pub fn remaining(&self) -> Duration {
        match self.last_send {
            Some(last_send) => self.interval.saturating_sub(last_send.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn acquire(&mut self) {
        let sleep_time = self.remaining();

        if sleep_time > SPIN_THRESHOLD {
            thread::sleep(sleep_time);
        } else if !sleep_time.is_zero() {
            let now = Instant::now();
            while now.elapsed() < sleep_time {
                std::hint::spin_loop();
            }
        }

        self.last_send = Some(Instant::now());
    }
}
