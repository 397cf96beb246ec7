// Command watchdog
// Counts ticks down from the reload value; any accepted command feeds it.
// What happens on expiry is decided by the controller, not here.

use tracing::trace;

#[derive(Debug, Clone)]
pub struct Watchdog {
    counter: u32,
    timeout: u32,
}

impl Watchdog {
    /// Create an expired watchdog; the first feed arms it
    pub fn new(timeout_ticks: u32) -> Self {
        Self {
            counter: 0,
            timeout: timeout_ticks.max(1),
        }
    }

    /// Reload the counter
    pub fn feed(&mut self) {
        trace!("Watchdog fed");
        self.counter = self.timeout;
    }

    /// One period elapsed; saturates at zero
    pub fn tick(&mut self) {
        self.counter = self.counter.saturating_sub(1);
    }

    pub fn expired(&self) -> bool {
        self.counter == 0
    }

    pub fn remaining(&self) -> u32 {
        self.counter
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }
}
