//! Channel configuration for coordinator/worker communication

use serde::{Deserialize, Serialize};

/// Channel buffer configuration
///
/// Every queue between lanes, workers and the coordinator is bounded, so a slow
/// consumer blocks its producers instead of growing memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Sample queue size (lanes -> worker)
    pub sample_buffer: usize,

    /// Maximum number of samples sent upstream in one batch
    pub sample_batch: usize,

    /// Message buffer per coordinator/worker link
    pub link_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            sample_buffer: 10_000,
            sample_batch: 256,
            link_buffer: 1_024,
        }
    }
}

impl ChannelConfig {
    /// Set the sample queue size
    pub fn with_sample_buffer(mut self, size: usize) -> Self {
        self.sample_buffer = size;
        self
    }

    /// Set the upstream batch size
    pub fn with_sample_batch(mut self, size: usize) -> Self {
        self.sample_batch = size;
        self
    }

    /// Set the per-link message buffer
    pub fn with_link_buffer(mut self, size: usize) -> Self {
        self.link_buffer = size;
        self
    }
}
