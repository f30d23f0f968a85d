//! Spectral feature operators

use crate::processor::{expect_inputs, OperatorConfig, OperatorState, StatefulOperator};
use bsp_core::{BspError, BspResult, SignalBlock, SignalKind, StreamInfo};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Frequency band definition for spectral analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub low_freq: f32,
    pub high_freq: f32,
}

impl FrequencyBand {
    /// Alpha rhythm, 8-13 Hz
    pub fn alpha() -> Self {
        FrequencyBand { low_freq: 8.0, high_freq: 13.0 }
    }

    /// Beta rhythm, 13-30 Hz
    pub fn beta() -> Self {
        FrequencyBand { low_freq: 13.0, high_freq: 30.0 }
    }
}

#[derive(Debug, Clone, Serialize)]
struct BandPowerState {
    history: Vec<VecDeque<f32>>,
    since_last: usize,
    first_bin: usize,
    last_bin: usize,
}

/// Band power over a sliding window, one output sample every `hop` input samples.
///
/// Output channels keep the input labels; the output sampling rate is the
/// input rate divided by `hop`.
pub struct BandPower {
    name: String,
    band: FrequencyBand,
    window: usize,
    hop: usize,
    log_scale: bool,
    fft: Arc<dyn Fft<f32>>,
    taper: Vec<f32>,
}

impl BandPower {
    pub fn new(
        name: &str,
        band: FrequencyBand,
        window: usize,
        hop: usize,
        log_scale: bool,
    ) -> BspResult<Self> {
        if window < 2 || hop == 0 {
            return Err(BspError::configuration(format!(
                "{}: window must be at least 2 samples and hop at least 1 (got {} / {})",
                name, window, hop
            )));
        }
        if !(band.low_freq >= 0.0 && band.high_freq > band.low_freq) {
            return Err(BspError::configuration(format!(
                "{}: band [{}, {}] Hz is empty",
                name, band.low_freq, band.high_freq
            )));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window);

        // Hann taper
        let taper = (0..window)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / (window - 1) as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();

        Ok(BandPower {
            name: name.to_string(),
            band,
            window,
            hop,
            log_scale,
            fft,
            taper,
        })
    }

    /// `band_power` from catalog parameters (`low`, `high`, `window`, `hop`, optional `log`)
    pub fn from_config(config: &OperatorConfig) -> BspResult<Self> {
        let band = FrequencyBand {
            low_freq: config.require_float("low")? as f32,
            high_freq: config.require_float("high")? as f32,
        };
        let window = config.require_usize("window")?;
        let hop = config.get_int("hop", window as i64).max(0) as usize;
        Self::new(&config.name, band, window, hop, config.get_bool("log", true))
    }

    fn power(&self, history: &VecDeque<f32>, first_bin: usize, last_bin: usize) -> f32 {
        let mean = history.iter().sum::<f32>() / history.len() as f32;
        let mut spectrum: Vec<Complex<f32>> = history
            .iter()
            .zip(&self.taper)
            .map(|(&x, &w)| Complex::new((x - mean) * w, 0.0))
            .collect();
        self.fft.process(&mut spectrum);

        let bins = &spectrum[first_bin..=last_bin];
        let power = bins.iter().map(|c| c.norm_sqr()).sum::<f32>()
            / (bins.len() * self.window) as f32;

        if self.log_scale {
            power.max(f32::MIN_POSITIVE).log10()
        } else {
            power
        }
    }
}

impl StatefulOperator for BandPower {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        StreamInfo::with_locations(
            SignalKind::Derived,
            inputs[0].sampling_rate / self.hop as f32,
            inputs[0].channels.clone(),
        )
    }

    fn init_state(&self, inputs: &[StreamInfo]) -> BspResult<OperatorState> {
        expect_inputs(&self.name, inputs, 1)?;
        let srate = inputs[0].sampling_rate;
        let resolution = srate / self.window as f32;
        let nyquist_bin = self.window / 2;

        let first_bin = (self.band.low_freq / resolution).ceil() as usize;
        let last_bin = ((self.band.high_freq / resolution).floor() as usize).min(nyquist_bin);
        if first_bin > last_bin {
            return Err(BspError::configuration(format!(
                "{}: band [{}, {}] Hz contains no frequency bin at {} Hz resolution",
                self.name, self.band.low_freq, self.band.high_freq, resolution
            )));
        }

        Ok(OperatorState::new(BandPowerState {
            history: vec![VecDeque::with_capacity(self.window + 1); inputs[0].channel_count()],
            since_last: 0,
            first_bin,
            last_bin,
        }))
    }

    fn apply(&self, state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        let input = &inputs[0];
        let state = state.downcast_mut::<BandPowerState>()?;

        if input.channel_count() != state.history.len() {
            return Err(BspError::shape(
                format!("input channels of '{}'", self.name),
                state.history.len(),
                input.channel_count(),
            ));
        }

        let out_rate = input.sampling_rate() / self.hop as f32;
        let mut output = SignalBlock::empty(input.channel_count(), out_rate);

        for frame in input.frames() {
            for (history, &sample) in state.history.iter_mut().zip(frame) {
                history.push_back(sample);
                if history.len() > self.window {
                    history.pop_front();
                }
            }
            state.since_last += 1;

            if state.since_last >= self.hop && state.history[0].len() == self.window {
                let powers: Vec<f32> = state
                    .history
                    .iter()
                    .map(|h| self.power(h, state.first_bin, state.last_bin))
                    .collect();
                output.push_frame(&powers)?;
                state.since_last = 0;
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StreamInfo {
        StreamInfo::new(SignalKind::Eeg, 128.0, &["O1", "O2"]).unwrap()
    }

    fn two_channel(samples: usize) -> SignalBlock {
        // O1 carries a 10 Hz rhythm, O2 a 25 Hz rhythm
        let mut data = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let t = i as f32 / 128.0;
            data.push((2.0 * std::f32::consts::PI * 10.0 * t).sin());
            data.push((2.0 * std::f32::consts::PI * 25.0 * t).sin());
        }
        SignalBlock::new(data, 2, 128.0).unwrap()
    }

    #[test]
    fn test_alpha_power_dominates() {
        let op = BandPower::new("band_power", FrequencyBand::alpha(), 128, 32, true).unwrap();
        let mut state = op.init_state(&[layout()]).unwrap();

        let output = op.apply(&mut state, &[two_channel(256)]).unwrap();
        // Full window at 128, then every 32 samples
        assert_eq!(output.samples(), 5);
        assert_eq!(output.sampling_rate(), 4.0);

        let last = output.frame(4);
        assert!(last[0] > last[1] + 2.0, "alpha {} vs beta-band {}", last[0], last[1]);
    }

    #[test]
    fn test_hop_carries_across_blocks() {
        let op = BandPower::new("band_power", FrequencyBand::beta(), 64, 16, false).unwrap();
        let mut state = op.init_state(&[layout()]).unwrap();

        let first = op.apply(&mut state, &[two_channel(70)]).unwrap();
        assert_eq!(first.samples(), 1);

        let mut data = two_channel(10);
        let second = op.apply(&mut state, &[data.take_front(10)]).unwrap();
        assert_eq!(second.samples(), 1);
    }

    #[test]
    fn test_output_layout() {
        let op = BandPower::new("band_power", FrequencyBand::alpha(), 128, 64, true).unwrap();
        let out = op.output_layout(&[layout()]).unwrap();
        assert_eq!(out.sampling_rate, 2.0);
        assert_eq!(out.labels(), vec!["O1", "O2"]);
        assert_eq!(out.kind, SignalKind::Derived);
    }

    #[test]
    fn test_band_without_bins() {
        let band = FrequencyBand { low_freq: 10.1, high_freq: 10.2 };
        let op = BandPower::new("band_power", band, 64, 8, true).unwrap();
        assert!(matches!(
            op.init_state(&[layout()]),
            Err(BspError::Configuration { .. })
        ));
    }
}
