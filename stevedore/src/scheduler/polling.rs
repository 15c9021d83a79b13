use std::time::Duration;

use crate::config::PollingInterval;

/// Tracks the delay between claims that return nothing.
#[derive(Debug)]
pub(crate) struct PollingBackoff {
    config: PollingInterval,
    current: Duration,
}

impl PollingBackoff {
    pub(crate) fn new(config: PollingInterval) -> Self {
        Self {
            config,
            current: config.start,
        }
    }

    /// The delay to wait now, growing the delay used after the next empty claim.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let max = self.config.max;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.factor)
            .map_or(max, |grown| grown.min(max));
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.config.start;
    }
}
