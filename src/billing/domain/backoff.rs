//! Reconnect delay controller.

use std::time::Duration;

pub const DEFAULT_RECONNECT_FLOOR: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_CEILING: Duration = Duration::from_secs(15 * 60);

/// Exponential reconnect backoff.
///
/// `next_delay` hands out the current delay and then doubles it, capped at the
/// ceiling. `reset` drops back to the floor after a successful connection.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        // a floor above the ceiling would hand out a delay past the cap
        let floor = floor.min(ceiling);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Delay the next call to `next_delay` will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_FLOOR, DEFAULT_RECONNECT_CEILING)
    }
}
