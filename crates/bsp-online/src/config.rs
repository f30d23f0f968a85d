//! Runtime configuration of the online engine

use crate::background::BackgroundOptions;
use crate::model::OutputFormat;
use bsp_core::{BspError, BspResult};
use bsp_processing::PipelineConfig;
use bsp_simulation::FeederConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Live stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Registry name of the stream
    pub name: String,
    /// Ring buffer length in seconds
    pub buffer_seconds: f32,
    /// Capacity of the marker ring
    pub marker_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "eeg".to_string(),
            buffer_seconds: 30.0,
            marker_capacity: 1000,
        }
    }
}

/// Background prediction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub predictor_name: String,
    /// Prediction rate in Hz
    pub update_freq: f64,
    /// Seconds before the first prediction
    pub start_delay: f64,
    pub output_format: OutputFormat,
    pub predict_at_markers: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let options = BackgroundOptions::default();
        Self {
            predictor_name: options.predictor_name,
            update_freq: options.update_freq,
            start_delay: options.start_delay,
            output_format: options.output_format,
            predict_at_markers: options.predict_at_markers,
        }
    }
}

/// Online engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OnlineConfig {
    pub stream: StreamSettings,
    pub scheduler: SchedulerSettings,
    pub pipeline: PipelineConfig,
    /// Simulated source feeding the stream
    pub source: FeederConfig,
    /// Model file (JSON); the built-in alpha model when absent
    pub model: Option<PathBuf>,
    /// Stop after this many seconds; run until interrupted when absent
    pub duration: Option<f64>,
}

impl OnlineConfig {
    /// Validate configuration
    pub fn validate(&self) -> BspResult<()> {
        if self.stream.name.is_empty() {
            return Err(BspError::configuration("Stream name cannot be empty"));
        }
        if !self.stream.buffer_seconds.is_finite() || self.stream.buffer_seconds <= 0.0 {
            return Err(BspError::configuration("Stream buffer length must be positive"));
        }
        if self.stream.marker_capacity == 0 {
            return Err(BspError::configuration("Marker capacity must be greater than 0"));
        }
        if self.scheduler.predictor_name.is_empty() {
            return Err(BspError::configuration("Predictor name cannot be empty"));
        }
        if !self.scheduler.update_freq.is_finite() || self.scheduler.update_freq <= 0.0 {
            return Err(BspError::configuration("Update frequency must be positive"));
        }
        if !self.scheduler.start_delay.is_finite() || self.scheduler.start_delay < 0.0 {
            return Err(BspError::configuration("Start delay cannot be negative"));
        }
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(BspError::configuration("Run duration must be positive"));
            }
        }
        self.pipeline.validate()?;
        self.source.validate()
    }

    /// Options for starting the background predictor
    pub fn background_options(&self) -> BackgroundOptions {
        BackgroundOptions {
            output_format: self.scheduler.output_format,
            update_freq: self.scheduler.update_freq,
            start_delay: self.scheduler.start_delay,
            predictor_name: self.scheduler.predictor_name.clone(),
            predict_at_markers: self.scheduler.predict_at_markers.clone(),
            empty_value: None,
            pipeline: self.pipeline.clone(),
        }
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> BspResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            BspError::configuration(format!("Failed to serialize configuration: {}", e))
        })
    }

    /// Import configuration from JSON
    pub fn from_json(json: &str) -> BspResult<Self> {
        let config: OnlineConfig = serde_json::from_str(json).map_err(|e| {
            BspError::configuration(format!("Failed to deserialize configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(OnlineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = OnlineConfig::from_json(
            r#"{
                "stream": { "name": "lsl-eeg" },
                "scheduler": { "update_freq": 4.0, "output_format": "mode" },
                "duration": 10.0
            }"#,
        )
        .unwrap();

        assert_eq!(config.stream.name, "lsl-eeg");
        assert_eq!(config.stream.buffer_seconds, 30.0);
        assert_eq!(config.scheduler.output_format, OutputFormat::Mode);

        let options = config.background_options();
        assert_eq!(options.update_freq, 4.0);
        assert_eq!(options.predictor_name, "lastpredictor");
    }

    #[test]
    fn test_config_validation() {
        let mut config = OnlineConfig::default();
        config.scheduler.update_freq = 0.0;
        assert!(matches!(config.validate(), Err(BspError::Configuration { .. })));

        let mut config = OnlineConfig::default();
        config.duration = Some(-1.0);
        assert!(config.validate().is_err());

        assert!(OnlineConfig::from_json(r#"{ "stream": { "marker_capacity": 0 } }"#).is_err());
    }
}
