//! Causal digital filters for online EEG processing
//!
//! All filters here are stateful: their history is carried in an
//! [`OperatorState`] between ticks so block-wise filtering matches filtering
//! the whole signal at once.

use crate::processor::{expect_inputs, OperatorConfig, OperatorState, StatefulOperator};
use bsp_core::{BspError, BspResult, SignalBlock, StreamInfo};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Filter types supported by the framework
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FilterType {
    /// Butterworth lowpass filter
    ButterworthLowpass { cutoff: f32, order: usize },
    /// Butterworth highpass filter
    ButterworthHighpass { cutoff: f32, order: usize },
    /// Notch filter for powerline interference
    Notch { freq: f32, q: f32 },
}

/// Single biquad section (2nd order)
#[derive(Debug, Clone, Serialize)]
struct BiquadSection {
    // Coefficients: y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
    b0: f32, b1: f32, b2: f32,
    a1: f32, a2: f32,
    // State per channel
    x1: Vec<f32>, x2: Vec<f32>, // Input history
    y1: Vec<f32>, y2: Vec<f32>, // Output history
}

impl BiquadSection {
    fn new(channel_count: usize) -> Self {
        Self {
            b0: 1.0, b1: 0.0, b2: 0.0,
            a1: 0.0, a2: 0.0,
            x1: vec![0.0; channel_count],
            x2: vec![0.0; channel_count],
            y1: vec![0.0; channel_count],
            y2: vec![0.0; channel_count],
        }
    }

    fn process_sample(&mut self, input: f32, channel: usize) -> f32 {
        // Direct form I
        let output = self.b0 * input + self.b1 * self.x1[channel] + self.b2 * self.x2[channel]
            - self.a1 * self.y1[channel] - self.a2 * self.y2[channel];

        self.x2[channel] = self.x1[channel];
        self.x1[channel] = input;
        self.y2[channel] = self.y1[channel];
        self.y1[channel] = output;

        output
    }
}

/// Carried state of a biquad cascade
#[derive(Debug, Clone, Serialize)]
struct BiquadState {
    sections: Vec<BiquadSection>,
}

/// Cascade of biquad sections designed from a [`FilterType`]
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    name: String,
    filter_type: FilterType,
}

impl BiquadFilter {
    pub fn new(name: &str, filter_type: FilterType) -> BspResult<Self> {
        match filter_type {
            FilterType::ButterworthLowpass { cutoff, order }
            | FilterType::ButterworthHighpass { cutoff, order } => {
                if !(cutoff > 0.0 && cutoff.is_finite()) {
                    return Err(BspError::configuration(format!(
                        "{}: cutoff frequency must be positive, got {}",
                        name, cutoff
                    )));
                }
                if order == 0 || order % 2 != 0 || order > 8 {
                    return Err(BspError::configuration(format!(
                        "{}: Butterworth order must be 2, 4, 6 or 8, got {}",
                        name, order
                    )));
                }
            }
            FilterType::Notch { freq, q } => {
                if !(freq > 0.0 && q > 0.0) {
                    return Err(BspError::configuration(format!(
                        "{}: notch frequency and quality factor must be positive",
                        name
                    )));
                }
            }
        }

        Ok(BiquadFilter {
            name: name.to_string(),
            filter_type,
        })
    }

    /// `highpass` from catalog parameters (`cutoff`, optional `order`)
    pub fn highpass_from_config(config: &OperatorConfig) -> BspResult<Self> {
        let cutoff = config.require_float("cutoff")? as f32;
        let order = config.get_int("order", 2).max(0) as usize;
        Self::new(&config.name, FilterType::ButterworthHighpass { cutoff, order })
    }

    /// `lowpass` from catalog parameters (`cutoff`, optional `order`)
    pub fn lowpass_from_config(config: &OperatorConfig) -> BspResult<Self> {
        let cutoff = config.require_float("cutoff")? as f32;
        let order = config.get_int("order", 2).max(0) as usize;
        Self::new(&config.name, FilterType::ButterworthLowpass { cutoff, order })
    }

    /// `notch` from catalog parameters (`freq`, optional `q`)
    pub fn notch_from_config(config: &OperatorConfig) -> BspResult<Self> {
        let freq = config.require_float("freq")? as f32;
        let q = config.get_float("q", 30.0) as f32;
        Self::new(&config.name, FilterType::Notch { freq, q })
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    fn design(&self, fs: f32, channel_count: usize) -> BspResult<Vec<BiquadSection>> {
        let nyquist = fs / 2.0;
        match self.filter_type {
            FilterType::ButterworthLowpass { cutoff, order }
            | FilterType::ButterworthHighpass { cutoff, order } => {
                if cutoff >= nyquist {
                    return Err(BspError::configuration(format!(
                        "{}: cutoff {} Hz must be below the Nyquist frequency {} Hz",
                        self.name, cutoff, nyquist
                    )));
                }
                let highpass = matches!(self.filter_type, FilterType::ButterworthHighpass { .. });

                // Pre-warp frequency for bilinear transform
                let k = (std::f32::consts::PI * cutoff / fs).tan();
                let k2 = k * k;

                let sections = (0..order / 2)
                    .map(|i| {
                        // Pole pair quality factor of the i-th Butterworth section
                        let theta = std::f32::consts::PI * (2 * i + 1) as f32 / (2 * order) as f32;
                        let q = 1.0 / (2.0 * theta.sin());
                        let norm = 1.0 / (1.0 + k / q + k2);

                        let mut biquad = BiquadSection::new(channel_count);
                        if highpass {
                            biquad.b0 = norm;
                            biquad.b1 = -2.0 * biquad.b0;
                        } else {
                            biquad.b0 = k2 * norm;
                            biquad.b1 = 2.0 * biquad.b0;
                        }
                        biquad.b2 = biquad.b0;
                        biquad.a1 = 2.0 * (k2 - 1.0) * norm;
                        biquad.a2 = (1.0 - k / q + k2) * norm;
                        biquad
                    })
                    .collect();
                Ok(sections)
            }
            FilterType::Notch { freq, q } => {
                if freq >= nyquist {
                    return Err(BspError::configuration(format!(
                        "{}: notch frequency {} Hz must be below the Nyquist frequency {} Hz",
                        self.name, freq, nyquist
                    )));
                }
                let omega = 2.0 * std::f32::consts::PI * freq / fs;
                let alpha = omega.sin() / (2.0 * q);
                let cos_omega = omega.cos();
                let a0 = 1.0 + alpha;

                let mut biquad = BiquadSection::new(channel_count);
                biquad.b0 = 1.0 / a0;
                biquad.b1 = -2.0 * cos_omega / a0;
                biquad.b2 = 1.0 / a0;
                biquad.a1 = -2.0 * cos_omega / a0;
                biquad.a2 = (1.0 - alpha) / a0;
                Ok(vec![biquad])
            }
        }
    }
}

impl StatefulOperator for BiquadFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn preserves_samples(&self) -> bool {
        true
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn init_state(&self, inputs: &[StreamInfo]) -> BspResult<OperatorState> {
        expect_inputs(&self.name, inputs, 1)?;
        let sections = self.design(inputs[0].sampling_rate, inputs[0].channel_count())?;
        Ok(OperatorState::new(BiquadState { sections }))
    }

    fn apply(&self, state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        let input = &inputs[0];
        let state = state.downcast_mut::<BiquadState>()?;

        let channels = state.sections.first().map(|s| s.x1.len()).unwrap_or(0);
        if input.channel_count() != channels {
            return Err(BspError::shape(
                format!("input channels of '{}'", self.name),
                channels,
                input.channel_count(),
            ));
        }

        let mut processed = Vec::with_capacity(input.data().len());
        for frame in input.frames() {
            for (channel, &value) in frame.iter().enumerate() {
                let mut sample = value;
                for biquad in &mut state.sections {
                    sample = biquad.process_sample(sample, channel);
                }
                processed.push(sample);
            }
        }

        SignalBlock::new(processed, input.channel_count(), input.sampling_rate())
    }
}

/// Carried state of a moving average
#[derive(Debug, Clone, Serialize)]
struct MovingAverageState {
    buffers: Vec<VecDeque<f32>>,
    sums: Vec<f64>,
}

/// Causal moving average over the last `window_size` samples
#[derive(Debug, Clone)]
pub struct MovingAverageFilter {
    name: String,
    window_size: usize,
}

impl MovingAverageFilter {
    pub fn new(name: &str, window_size: usize) -> BspResult<Self> {
        if window_size == 0 {
            return Err(BspError::configuration(format!(
                "{}: window size must be at least one sample",
                name
            )));
        }
        Ok(MovingAverageFilter {
            name: name.to_string(),
            window_size,
        })
    }

    pub fn from_config(config: &OperatorConfig) -> BspResult<Self> {
        Self::new(&config.name, config.require_usize("window")?)
    }
}

impl StatefulOperator for MovingAverageFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn preserves_samples(&self) -> bool {
        true
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn init_state(&self, inputs: &[StreamInfo]) -> BspResult<OperatorState> {
        expect_inputs(&self.name, inputs, 1)?;
        let channels = inputs[0].channel_count();
        Ok(OperatorState::new(MovingAverageState {
            buffers: vec![VecDeque::with_capacity(self.window_size); channels],
            sums: vec![0.0; channels],
        }))
    }

    fn apply(&self, state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        let input = &inputs[0];
        let state = state.downcast_mut::<MovingAverageState>()?;

        if input.channel_count() != state.buffers.len() {
            return Err(BspError::shape(
                format!("input channels of '{}'", self.name),
                state.buffers.len(),
                input.channel_count(),
            ));
        }

        let mut processed = Vec::with_capacity(input.data().len());
        for frame in input.frames() {
            for (channel, &sample) in frame.iter().enumerate() {
                let buffer = &mut state.buffers[channel];
                buffer.push_back(sample);
                state.sums[channel] += sample as f64;

                if buffer.len() > self.window_size {
                    if let Some(old_sample) = buffer.pop_front() {
                        state.sums[channel] -= old_sample as f64;
                    }
                }

                processed.push((state.sums[channel] / buffer.len() as f64) as f32);
            }
        }

        SignalBlock::new(processed, input.channel_count(), input.sampling_rate())
    }
}
