//! Engine configuration.

use std::time::Duration;

use crate::job::DEFAULT_TTR_SECS;

/// Configuration for the processing engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue name, passed to plugins at init.
    pub queue_name: String,
    /// Lease duration applied when a submission does not set one.
    pub default_ttr: Duration,
    /// Sleep between polls when a repeating run finds no job.
    pub idle_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_name: "toil".to_string(),
            default_ttr: Duration::from_secs(DEFAULT_TTR_SECS),
            idle_sleep: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Create a new builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue name.
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue_name = name.into();
        self
    }

    /// Set the default lease duration.
    pub fn default_ttr(mut self, ttr: Duration) -> Self {
        self.config.default_ttr = ttr;
        self
    }

    /// Set the idle sleep between empty polls.
    pub fn idle_sleep(mut self, sleep: Duration) -> Self {
        self.config.idle_sleep = sleep;
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
