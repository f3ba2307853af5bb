//! Driver configuration.

use super::lineage::{LineageGranularity, LineageRetention};

/// Default maximum number of states written per storage put.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 256;

/// Configuration of a [`Driver`](super::Driver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Shape of recorded lineage entries.
    pub lineage_granularity: LineageGranularity,
    /// How much transitive lineage each row keeps.
    pub lineage_retention: LineageRetention,
    /// Maximum states per `StateStorage::put` during flush.
    pub flush_batch_size: usize,
    /// Record a build journal in every context.
    pub journaling: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            lineage_granularity: LineageGranularity::Id,
            lineage_retention: LineageRetention::Minimal,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            journaling: false,
        }
    }
}

impl DriverConfig {
    /// Sets the lineage granularity.
    #[must_use]
    pub fn with_lineage_granularity(mut self, granularity: LineageGranularity) -> Self {
        self.lineage_granularity = granularity;
        self
    }

    /// Sets the lineage retention.
    #[must_use]
    pub fn with_lineage_retention(mut self, retention: LineageRetention) -> Self {
        self.lineage_retention = retention;
        self
    }

    /// Sets the flush batch size.
    #[must_use]
    pub fn with_flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size;
        self
    }

    /// Enables or disables journaling.
    #[must_use]
    pub fn with_journaling(mut self, enabled: bool) -> Self {
        self.journaling = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.flush_batch_size == 0 {
            return Err("flush_batch_size must be positive".to_string());
        }
        Ok(())
    }
}
