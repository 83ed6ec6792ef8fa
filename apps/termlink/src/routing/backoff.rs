//! Delay policy for temporary accept failures.

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Exponential retry delay owned by a single accept loop.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next delay: 5ms first, then doubling up to 1s.
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            INITIAL_DELAY
        } else {
            (self.delay * 2).min(MAX_DELAY)
        };
        self.delay
    }

    /// Called after every successful accept.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}
