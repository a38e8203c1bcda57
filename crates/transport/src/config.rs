//! Transport tunables.

use crate::queue::MAX_QUEUE_SIZE;
use crate::regs::features;

/// Driver-side configuration applied at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Feature bits the driver accepts. Negotiated = offered & these.
    pub driver_features: u64,
    /// Polls allowed for a full reset or a queue reset to complete.
    pub reset_poll_limit: u32,
    /// Retries allowed for a generation-consistent config read.
    pub generation_retry_limit: u32,
    /// Upper bound on any queue size, on top of the device maximum.
    pub max_queue_size: u16,
    /// Write the observed ISR value back after dispatch.
    pub isr_write_back: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            driver_features: features::VERSION_1 | features::RING_EVENT_IDX,
            reset_poll_limit: 1000,
            generation_retry_limit: 16,
            max_queue_size: MAX_QUEUE_SIZE,
            isr_write_back: true,
        }
    }
}

impl TransportConfig {
    pub fn with_features(mut self, driver_features: u64) -> Self {
        self.driver_features = driver_features;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: u16) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}
