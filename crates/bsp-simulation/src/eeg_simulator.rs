//! Multichannel EEG simulator: modulated alpha rhythm, noise and periodic markers

use crate::signal_patterns::SignalPattern;
use bsp_core::{BspError, BspResult, Marker, SignalBlock, SignalKind, StreamInfo};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Noise configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Gaussian noise standard deviation (0.0 = no noise)
    pub gaussian_std: f32,
    /// Baseline wander amplitude
    pub baseline_wander: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gaussian_std: 2.0,
            baseline_wander: 1.0,
        }
    }
}

/// Periodic event marker injection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Marker type label
    pub kind: String,
    /// Interval between markers in seconds
    pub interval: f32,
}

/// Configuration for EEG simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EegConfig {
    /// Channel labels
    pub channels: Vec<String>,
    /// Sampling rate in Hz
    pub sampling_rate: f32,
    /// Alpha rhythm frequency in Hz
    pub alpha_freq: f32,
    /// Alpha amplitude in microvolts at modulation level 1.0
    pub alpha_amplitude: f32,
    /// Alpha amplitude modulation over time
    pub pattern: SignalPattern,
    pub noise: NoiseConfig,
    /// Power line interference (50/60Hz)
    pub powerline_freq: Option<f32>,
    pub markers: Option<MarkerConfig>,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for EegConfig {
    fn default() -> Self {
        Self {
            channels: ["C3", "Cz", "C4", "P3", "Pz", "P4", "O1", "O2"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            sampling_rate: 250.0,
            alpha_freq: 10.0,
            alpha_amplitude: 20.0,
            pattern: SignalPattern::default(),
            noise: NoiseConfig::default(),
            powerline_freq: Some(50.0),
            markers: None,
            seed: None,
        }
    }
}

impl EegConfig {
    /// Stream metadata matching the simulated data
    pub fn stream_info(&self) -> BspResult<StreamInfo> {
        let labels: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        StreamInfo::new(SignalKind::Eeg, self.sampling_rate, &labels)
    }

    /// Validate configuration
    pub fn validate(&self) -> BspResult<()> {
        self.stream_info()?;
        if !(self.alpha_freq > 0.0 && self.alpha_freq < self.sampling_rate / 2.0) {
            return Err(BspError::configuration(format!(
                "alpha frequency {} Hz must lie between 0 and Nyquist",
                self.alpha_freq
            )));
        }
        if self.noise.gaussian_std < 0.0 || !self.noise.gaussian_std.is_finite() {
            return Err(BspError::configuration("noise standard deviation must be non-negative"));
        }
        if let Some(markers) = &self.markers {
            if !markers.interval.is_finite() || markers.interval <= 0.0 {
                return Err(BspError::configuration("marker interval must be positive"));
            }
        }
        Ok(())
    }
}

/// EEG signal simulator
pub struct EegSimulator {
    config: EegConfig,
    rng: rand::rngs::StdRng,
    normal_dist: Normal<f32>,
    // Samples generated so far
    position: u64,
    // Per-channel alpha phase offsets
    phases: Vec<f32>,
}

impl EegSimulator {
    /// Create new EEG simulator with configuration
    pub fn new(config: EegConfig) -> BspResult<Self> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let normal_dist = Normal::new(0.0, config.noise.gaussian_std).map_err(|e| {
            BspError::configuration(format!("Failed to create normal distribution: {}", e))
        })?;
        let phases = (0..config.channels.len())
            .map(|_| rng.gen_range(0.0..2.0 * PI))
            .collect();

        Ok(EegSimulator {
            config,
            rng,
            normal_dist,
            position: 0,
            phases,
        })
    }

    /// Generate the next `samples` frames with the markers falling inside them.
    ///
    /// Marker latencies are relative to the returned block (1-based).
    pub fn generate(&mut self, samples: usize) -> BspResult<(SignalBlock, Vec<Marker>)> {
        let channel_count = self.config.channels.len();
        let srate = self.config.sampling_rate;
        let mut data = Vec::with_capacity(samples * channel_count);

        for sample_idx in 0..samples {
            let time = (self.position + sample_idx as u64) as f32 / srate;
            let level = self.config.pattern.level_at_time(time);

            for channel_idx in 0..channel_count {
                let mut value = self.alpha_sample(time, channel_idx, level);
                value += self.noise(time);
                if let Some(powerline_freq) = self.config.powerline_freq {
                    value += 0.5 * (2.0 * PI * powerline_freq * time).sin();
                }
                data.push(value);
            }
        }

        let markers = self.markers_between(self.position, samples as u64);
        self.position += samples as u64;

        let block = SignalBlock::new(data, channel_count, srate)?;
        Ok((block, markers))
    }

    /// Generate `duration` seconds of data
    pub fn generate_duration(&mut self, duration: f32) -> BspResult<(SignalBlock, Vec<Marker>)> {
        let samples = (duration * self.config.sampling_rate).round() as usize;
        self.generate(samples)
    }

    fn alpha_sample(&self, time: f32, channel_idx: usize, level: f32) -> f32 {
        // Occipital and parietal channels carry more alpha
        let label = &self.config.channels[channel_idx];
        let topography = match label.chars().next() {
            Some('O') => 1.0,
            Some('P') => 0.7,
            _ => 0.4,
        };
        let amplitude = self.config.alpha_amplitude * level * topography;
        amplitude * (2.0 * PI * self.config.alpha_freq * time + self.phases[channel_idx]).sin()
    }

    fn noise(&mut self, time: f32) -> f32 {
        let mut noise = self.normal_dist.sample(&mut self.rng);
        noise += self.config.noise.baseline_wander * (2.0 * PI * 0.1 * time).sin();
        noise
    }

    fn markers_between(&self, start: u64, count: u64) -> Vec<Marker> {
        let Some(config) = &self.config.markers else {
            return Vec::new();
        };
        let interval = (config.interval * self.config.sampling_rate).round().max(1.0) as u64;

        // Marker k sits on absolute sample k * interval
        let first = start / interval + 1;
        let mut markers = Vec::new();
        let mut k = first;
        while k * interval <= start + count {
            markers.push(Marker::new(&config.kind, (k * interval - start) as f64));
            k += 1;
        }
        markers
    }

    /// Total samples generated
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get current configuration
    pub fn config(&self) -> &EegConfig {
        &self.config
    }

    /// Replace the alpha modulation pattern
    pub fn set_pattern(&mut self, pattern: SignalPattern) {
        self.config.pattern = pattern;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsp_core::ChannelStats;

    fn seeded() -> EegConfig {
        EegConfig {
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_eeg_simulator_basic() {
        let mut simulator = EegSimulator::new(seeded()).unwrap();
        let (block, markers) = simulator.generate_duration(1.0).unwrap();

        assert_eq!(block.samples(), 250);
        assert_eq!(block.channel_count(), 8);
        assert_eq!(block.sampling_rate(), 250.0);
        assert!(markers.is_empty());
        assert_eq!(simulator.position(), 250);

        for channel in block.all_channels() {
            assert!(ChannelStats::calculate(&channel).std_dev > 0.0);
        }
    }

    #[test]
    fn test_seed_reproducibility() {
        let (a, _) = EegSimulator::new(seeded()).unwrap().generate(100).unwrap();
        let (b, _) = EegSimulator::new(seeded()).unwrap().generate(100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_occipital_alpha_is_stronger() {
        let config = EegConfig {
            noise: NoiseConfig { gaussian_std: 0.0, baseline_wander: 0.0 },
            powerline_freq: None,
            ..seeded()
        };
        let mut simulator = EegSimulator::new(config).unwrap();
        let (block, _) = simulator.generate(500).unwrap();

        let c3 = block.channel_stats(0).unwrap();
        let o1 = block.channel_stats(6).unwrap();
        assert!(o1.rms > 2.0 * c3.rms);
    }

    #[test]
    fn test_markers_across_blocks() {
        let config = EegConfig {
            markers: Some(MarkerConfig { kind: "cue".to_string(), interval: 0.4 }),
            ..seeded()
        };
        let mut simulator = EegSimulator::new(config).unwrap();

        // Interval of 100 samples: markers at absolute 100, 200, 300
        let (_, first) = simulator.generate(150).unwrap();
        let (_, second) = simulator.generate(150).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].latency, 100.0);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].latency, 50.0);
        assert_eq!(second[1].latency, 150.0);
        assert!(second.iter().all(|m| m.kind == "cue"));
    }

    #[test]
    fn test_invalid_config() {
        let config = EegConfig {
            alpha_freq: 200.0,
            ..Default::default()
        };
        assert!(matches!(EegSimulator::new(config), Err(BspError::Configuration { .. })));

        let config = EegConfig {
            channels: Vec::new(),
            ..Default::default()
        };
        assert!(EegSimulator::new(config).is_err());
    }
}
