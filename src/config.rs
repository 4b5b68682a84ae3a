use std::time::Duration;

/// Configuration for the job tracker.
///
/// Use [`TrackerConfig::builder()`] for ergonomic construction, or
/// [`TrackerConfig::default()`] for sensible defaults (2s polling, 3s orphan grace).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval between reconciliation polls while any job is active.
    pub poll_interval: Duration,

    /// How long events for a not-yet-known job are held before being
    /// dropped (0 = drop immediately).
    pub orphan_grace: Duration,

    /// Upper bound on held orphan events across all jobs.
    pub max_orphan_events: usize,

    /// Capacity of the channel returned by [`crate::event_channel`].
    pub event_buffer: usize,

    /// Capacity of the store change broadcast.
    pub change_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            orphan_grace: Duration::from_secs(3),
            max_orphan_events: 256,
            event_buffer: 256,
            change_buffer: 128,
        }
    }
}

impl TrackerConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder::default()
    }
}

/// Builder for [`TrackerConfig`].
#[derive(Default)]
pub struct TrackerConfigBuilder {
    config: TrackerConfig,
}

impl TrackerConfigBuilder {
    /// Set the reconciliation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set how long events for unknown jobs are buffered.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.config.orphan_grace = grace;
        self
    }

    /// Set the maximum number of buffered orphan events.
    pub fn with_max_orphan_events(mut self, max: usize) -> Self {
        self.config.max_orphan_events = max;
        self
    }

    /// Set the push-event channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity.max(1);
        self
    }

    /// Set the change broadcast capacity.
    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        self.config.change_buffer = capacity.max(1);
        self
    }

    /// Build the final [`TrackerConfig`].
    pub fn build(self) -> TrackerConfig {
        self.config
    }
}
