use std::cmp::min;
use std::time::Duration;

/// Retransmission timeout with exponential backoff: starts at the configured initial timeout,
///  doubles on every expiry up to the configured cap, and snaps back to the initial value as
///  soon as any ACK arrives.
#[derive(Debug)]
pub struct RetransmitBackoff {
    current: Duration,
    retries: u32,

    config_initial: Duration,
    config_max: Duration,
}

impl RetransmitBackoff {
    pub fn new(initial: Duration, max: Duration) -> RetransmitBackoff {
        assert!(initial <= max);

        RetransmitBackoff {
            current: initial,
            retries: 0,
            config_initial: initial,
            config_max: max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// register an expired timeout; returns the timeout to use for the next attempt
    pub fn on_timeout(&mut self) -> Duration {
        self.retries += 1;
        self.current = min(self.current * 2, self.config_max);
        self.current
    }

    pub fn on_ack(&mut self) {
        self.retries = 0;
        self.current = self.config_initial;
    }
}
