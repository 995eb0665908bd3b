// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Spin loop support for polling the card.

use std::time::Duration;
use std::time::Instant;

const SHORT_SLEEP_ATTEMPTS: u32 = 250;
const LONG_SLEEP_DURATION: Duration = Duration::from_millis(15);

/// Paces a polling loop.
///
/// This is useful when waiting for some condition (such as the card leaving
/// the programming state) that can only be polled. The loop initially just
/// yields, then sleeps for longer the more times it goes around.
#[derive(Debug)]
pub(crate) struct Backoff {
    started: Instant,
    spin: Duration,
    interval: Duration,
    n: u32,
}

impl Backoff {
    /// Yields for `spin`, then waits `interval` between polls.
    pub fn new(spin: Duration, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            spin,
            interval,
            n: 0,
        }
    }

    /// Returns how long to wait before the next poll. Zero means yield.
    pub fn next_delay(&mut self) -> Duration {
        if self.started.elapsed() < self.spin {
            return Duration::ZERO;
        }
        let delay = if self.n < SHORT_SLEEP_ATTEMPTS {
            self.interval
        } else {
            LONG_SLEEP_DURATION.max(self.interval)
        };
        self.n += 1;
        delay
    }

    /// Yields or sleeps the current thread.
    pub fn back_off(&mut self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }

    /// Starts over, for when the polled condition made progress.
    pub fn reset(&mut self) {
        *self = Self::new(self.spin, self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::Backoff;
    use super::SHORT_SLEEP_ATTEMPTS;
    use std::time::Duration;

    #[test]
    fn spins_then_sleeps() {
        let interval = Duration::from_millis(2);
        let mut backoff = Backoff::new(Duration::from_secs(3600), interval);
        assert_eq!(backoff.next_delay(), Duration::ZERO);

        let mut backoff = Backoff::new(Duration::ZERO, interval);
        assert_eq!(backoff.next_delay(), interval);
        for _ in 1..SHORT_SLEEP_ATTEMPTS {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(15));
        backoff.reset();
        assert_eq!(backoff.next_delay(), interval);
    }
}
