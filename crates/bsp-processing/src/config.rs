//! Configuration management for online pipelines

use bsp_core::{BspError, BspResult};
use serde::{Deserialize, Serialize};

/// What a leaf does when its stream has overwritten samples it never read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagPolicy {
    /// Skip ahead to the oldest retained sample and log the dropped count
    ResumeAtOldest,
    /// Fail the tick with a range error
    Fail,
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the output ring in samples
    pub output_capacity: usize,
    /// Capacity of the output marker ring
    pub output_marker_capacity: usize,
    /// Behaviour of a leaf that fell behind its stream's ring
    pub lag_policy: LagPolicy,
    /// Node invocations slower than this are logged (microseconds)
    pub slow_node_threshold_us: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_capacity: 4096,
            output_marker_capacity: 256,
            lag_policy: LagPolicy::ResumeAtOldest,
            slow_node_threshold_us: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Validate configuration
    pub fn validate(&self) -> BspResult<()> {
        if self.output_capacity == 0 {
            return Err(BspError::configuration("Output ring capacity must be greater than 0"));
        }
        if self.output_marker_capacity == 0 {
            return Err(BspError::configuration("Output marker capacity must be greater than 0"));
        }
        if self.slow_node_threshold_us == 0 {
            return Err(BspError::configuration("Slow node threshold must be greater than 0"));
        }
        Ok(())
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> BspResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            BspError::configuration(format!("Failed to serialize configuration: {}", e))
        })
    }

    /// Import configuration from JSON
    pub fn from_json(json: &str) -> BspResult<Self> {
        let config: PipelineConfig = serde_json::from_str(json).map_err(|e| {
            BspError::configuration(format!("Failed to deserialize configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}
