//! SignalBlock: contiguous multichannel sample container

use crate::error::{BspError, BspResult};
use serde::{Deserialize, Serialize};

/// A block of multichannel samples.
///
/// Samples are stored frame by frame (interleaved channels):
/// `[s0_ch0, s0_ch1, ..., s1_ch0, s1_ch1, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBlock {
    data: Vec<f32>,
    channel_count: usize,
    sampling_rate: f32,
}

impl SignalBlock {
    /// Create a block from interleaved data
    pub fn new(data: Vec<f32>, channel_count: usize, sampling_rate: f32) -> BspResult<Self> {
        if channel_count == 0 {
            return Err(BspError::invalid_argument(
                "channel_count",
                "a signal block needs at least one channel",
            ));
        }
        if data.len() % channel_count != 0 {
            return Err(BspError::shape(
                "interleaved sample data",
                channel_count,
                data.len() % channel_count,
            ));
        }

        Ok(SignalBlock {
            data,
            channel_count,
            sampling_rate,
        })
    }

    /// Block with no samples
    pub fn empty(channel_count: usize, sampling_rate: f32) -> Self {
        SignalBlock {
            data: Vec::new(),
            channel_count,
            sampling_rate,
        }
    }

    /// Create a block from per-channel vectors (channels x samples)
    pub fn from_channels(channels: &[Vec<f32>], sampling_rate: f32) -> BspResult<Self> {
        let channel_count = channels.len();
        let samples = channels.first().map(|c| c.len()).unwrap_or(0);

        if let Some(bad) = channels.iter().find(|c| c.len() != samples) {
            return Err(BspError::shape("per-channel sample count", samples, bad.len()));
        }

        let mut data = Vec::with_capacity(channel_count * samples);
        for sample_idx in 0..samples {
            for channel in channels {
                data.push(channel[sample_idx]);
            }
        }

        SignalBlock::new(data, channel_count, sampling_rate)
    }

    /// Number of samples (frames) per channel
    pub fn samples(&self) -> usize {
        self.data.len() / self.channel_count
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sampling_rate(&self) -> f32 {
        self.sampling_rate
    }

    /// Raw interleaved data
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume the block and return the interleaved data
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// One frame (all channels at one sample)
    pub fn frame(&self, sample_idx: usize) -> &[f32] {
        let start = sample_idx * self.channel_count;
        &self.data[start..start + self.channel_count]
    }

    /// Iterate frames in order
    pub fn frames(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.channel_count)
    }

    /// Single sample value
    pub fn value(&self, channel: usize, sample_idx: usize) -> f32 {
        self.data[sample_idx * self.channel_count + channel]
    }

    /// Get data for a specific channel
    pub fn channel_data(&self, channel_index: usize) -> BspResult<Vec<f32>> {
        if channel_index >= self.channel_count {
            return Err(BspError::invalid_argument(
                "channel",
                format!(
                    "channel index {} out of bounds (0-{})",
                    channel_index,
                    self.channel_count - 1
                ),
            ));
        }

        Ok(self
            .frames()
            .map(|frame| frame[channel_index])
            .collect())
    }

    /// Get all channel data as separate vectors
    pub fn all_channels(&self) -> Vec<Vec<f32>> {
        let mut channels = vec![Vec::with_capacity(self.samples()); self.channel_count];
        for frame in self.frames() {
            for (ch, &value) in frame.iter().enumerate() {
                channels[ch].push(value);
            }
        }
        channels
    }

    /// New block holding only the given channels, in the given order
    pub fn select_channels(&self, indices: &[usize]) -> BspResult<SignalBlock> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.channel_count) {
            return Err(BspError::invalid_argument(
                "channels",
                format!("channel index {} out of bounds (0-{})", bad, self.channel_count - 1),
            ));
        }

        let mut data = Vec::with_capacity(indices.len() * self.samples());
        for frame in self.frames() {
            data.extend(indices.iter().map(|&i| frame[i]));
        }

        SignalBlock::new(data, indices.len(), self.sampling_rate)
    }

    /// Append the samples of another block with the same channel count
    pub fn extend(&mut self, other: &SignalBlock) -> BspResult<()> {
        if other.channel_count != self.channel_count {
            return Err(BspError::shape(
                "appended block channels",
                self.channel_count,
                other.channel_count,
            ));
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    /// Push one frame
    pub fn push_frame(&mut self, frame: &[f32]) -> BspResult<()> {
        if frame.len() != self.channel_count {
            return Err(BspError::shape("frame", self.channel_count, frame.len()));
        }
        self.data.extend_from_slice(frame);
        Ok(())
    }

    /// Split off the first `count` samples, leaving the rest in `self`
    pub fn take_front(&mut self, count: usize) -> SignalBlock {
        let count = count.min(self.samples());
        let rest = self.data.split_off(count * self.channel_count);
        let front = std::mem::replace(&mut self.data, rest);
        SignalBlock {
            data: front,
            channel_count: self.channel_count,
            sampling_rate: self.sampling_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples() as f32 / self.sampling_rate
    }

    /// Calculate basic statistics for a channel
    pub fn channel_stats(&self, channel_index: usize) -> BspResult<ChannelStats> {
        let data = self.channel_data(channel_index)?;
        Ok(ChannelStats::calculate(&data))
    }
}

/// Basic statistics for a signal channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f32,
    pub rms: f32,
    pub std_dev: f32,
    pub min: f32,
    pub max: f32,
    pub peak_to_peak: f32,
}

impl ChannelStats {
    pub fn calculate(data: &[f32]) -> Self {
        if data.is_empty() {
            return Self {
                mean: 0.0,
                rms: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                peak_to_peak: 0.0,
            };
        }

        let sum: f32 = data.iter().sum();
        let mean = sum / data.len() as f32;

        let sum_sq: f32 = data.iter().map(|x| x * x).sum();
        let rms = (sum_sq / data.len() as f32).sqrt();

        let variance: f32 = data.iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f32>() / data.len() as f32;
        let std_dev = variance.sqrt();

        let min = data.iter().fold(f32::INFINITY, |a, &b| a.min(b));
        let max = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

        Self {
            mean,
            rms,
            std_dev,
            min,
            max,
            peak_to_peak: max - min,
        }
    }
}
