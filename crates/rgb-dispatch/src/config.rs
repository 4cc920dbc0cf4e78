//! Dispatcher tuning.

use crate::overlay::SendMode;

/// Starting capacity of subscriber arrays.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Starting capacity of pending-event queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Items per parallel batch during fan-out and job execution.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Upper bound on end-of-pass flush rounds before giving up for this pass.
pub const DEFAULT_MAX_END_OF_PASS_ROUNDS: usize = 1024;

/// Capacities and batch size shared by every dispatcher kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Starting capacity of the subscriber arrays.
    pub subscriber_capacity: usize,
    /// Starting capacity of the pending-event queue.
    pub queue_capacity: usize,
    /// Items per parallel batch.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfig {
    /// Default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the starting subscriber capacity.
    #[must_use]
    pub const fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Set the starting pending-queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the parallel batch size. Zero is treated as one.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }
}

/// Settings for [`SendOverlay`](crate::SendOverlay).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Mode used when a send asks for [`SendMode::Default`].
    pub default_mode: SendMode,
    /// Rounds `flush_end_of_pass` runs before leaving the rest for next time.
    pub max_end_of_pass_rounds: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayConfig {
    /// Default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            default_mode: SendMode::EndOfPass,
            max_end_of_pass_rounds: DEFAULT_MAX_END_OF_PASS_ROUNDS,
        }
    }

    /// Set the mode that [`SendMode::Default`] resolves to.
    ///
    /// # Panics
    ///
    /// Panics if `mode` is [`SendMode::Default`] itself.
    #[must_use]
    pub const fn with_default_mode(mut self, mode: SendMode) -> Self {
        assert!(
            !matches!(mode, SendMode::Default),
            "default send mode must be a concrete mode"
        );
        self.default_mode = mode;
        self
    }

    /// Set the end-of-pass round limit.
    #[must_use]
    pub const fn with_max_end_of_pass_rounds(mut self, rounds: usize) -> Self {
        self.max_end_of_pass_rounds = rounds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.subscriber_capacity, 100);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        assert_eq!(DispatcherConfig::new().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn test_overlay_default_mode() {
        assert_eq!(OverlayConfig::default().default_mode, SendMode::EndOfPass);
        let config = OverlayConfig::new().with_default_mode(SendMode::Immediate);
        assert_eq!(config.default_mode, SendMode::Immediate);
    }
}
