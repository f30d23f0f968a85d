//! Window extraction ("peek"): immutable snapshots of the most recent samples

use crate::error::{BspError, BspResult};
use crate::marker::Marker;
use crate::registry::StreamRegistry;
use crate::ring_buffer::RingBuffer;
use crate::signal_block::SignalBlock;
use crate::stream::{StreamHandle, StreamId};
use crate::stream_info::{ChannelLocation, StreamInfo};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unit of a window length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    /// Length in seconds
    Seconds,
    /// Length in samples
    Samples,
    /// Absolute sample index: everything newer than it
    Index,
}

impl FromStr for WindowUnit {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds" => Ok(WindowUnit::Seconds),
            "samples" => Ok(WindowUnit::Samples),
            "index" => Ok(WindowUnit::Index),
            other => Err(BspError::invalid_argument(
                "unit",
                format!("'{}' is not one of \"seconds\", \"samples\", \"index\"", other),
            )),
        }
    }
}

/// Channel restriction of a window request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ChannelSubset {
    #[default]
    All,
    /// Zero-based channel indices
    Indices(Vec<usize>),
    /// Channel labels
    Labels(Vec<String>),
}

impl ChannelSubset {
    pub fn labels<S: AsRef<str>>(labels: &[S]) -> Self {
        ChannelSubset::Labels(labels.iter().map(|l| l.as_ref().to_string()).collect())
    }

    /// Resolve to channel indices against stream metadata
    pub fn resolve(&self, info: &StreamInfo) -> BspResult<Vec<usize>> {
        let count = info.channel_count();
        let indices = match self {
            ChannelSubset::All => return Ok((0..count).collect()),
            ChannelSubset::Indices(indices) => {
                if let Some(bad) = indices.iter().find(|&&i| i >= count) {
                    return Err(BspError::invalid_argument(
                        "channels",
                        format!("channel index {} out of range for {} channels", bad, count),
                    ));
                }
                indices.clone()
            }
            ChannelSubset::Labels(labels) => labels
                .iter()
                .map(|label| {
                    info.channel_index(label).ok_or_else(|| {
                        BspError::invalid_argument(
                            "channels",
                            format!("unknown channel label '{}'", label),
                        )
                    })
                })
                .collect::<BspResult<Vec<_>>>()?,
        };

        if indices.is_empty() {
            return Err(BspError::invalid_argument("channels", "channel subset is empty"));
        }
        Ok(indices)
    }
}

/// Immutable snapshot of a stream window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Sample data (selected channels x window samples)
    pub data: SignalBlock,
    /// Events inside the window, latencies relative to its first sample (1-based)
    pub events: Vec<Marker>,
    /// Time of the first sample in seconds
    pub xmin: f64,
    /// Time of the last sample in seconds
    pub xmax: f64,
    /// Selected channels
    pub channels: Vec<ChannelLocation>,
    /// Logical index of the first sample
    pub first_index: u64,
    /// Logical index of the last sample
    pub last_index: u64,
}

impl Chunk {
    pub fn samples(&self) -> usize {
        self.data.samples()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sampling_rate(&self) -> f32 {
        self.data.sampling_rate()
    }

    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }
}

/// Number of samples a window request resolves to, clamped to the retained history
pub fn samples_to_get(
    length: f64,
    unit: WindowUnit,
    sampling_rate: f32,
    smax: u64,
    buffer_len: u64,
) -> BspResult<u64> {
    if !length.is_finite() || length < 0.0 {
        return Err(BspError::invalid_argument(
            "length",
            format!("{} is not a finite, non-negative window length", length),
        ));
    }

    let wanted = match unit {
        WindowUnit::Seconds => (sampling_rate as f64 * length).round() as u64,
        WindowUnit::Samples => length.round() as u64,
        WindowUnit::Index => smax.saturating_sub(length.floor() as u64),
    };

    Ok(wanted.min(buffer_len))
}

/// Extract a window from a ring buffer described by `info`
pub fn extract(
    ring: &RingBuffer,
    info: &StreamInfo,
    length: f64,
    unit: WindowUnit,
    channels: &ChannelSubset,
) -> BspResult<Chunk> {
    let indices = channels.resolve(info)?;
    let smax = ring.smax();
    let count = samples_to_get(length, unit, info.sampling_rate, smax, ring.retained())?;

    let first_index = smax - count + 1;
    let srate = info.sampling_rate as f64;

    let (data, events) = if count == 0 {
        (SignalBlock::empty(indices.len(), info.sampling_rate), Vec::new())
    } else {
        let block = ring.read_window(first_index, smax)?;
        let data = if indices.len() == info.channel_count() && indices.iter().enumerate().all(|(i, &c)| i == c) {
            block
        } else {
            block.select_channels(&indices)?
        };
        let offset = first_index as f64 - 1.0;
        let events = ring
            .markers_in(first_index, smax)
            .into_iter()
            .map(|m| m.shifted(-offset))
            .collect();
        (data, events)
    };

    let xmax = smax as f64 / srate;
    let xmin = xmax - (count as f64 - 1.0) / srate;

    Ok(Chunk {
        data,
        events,
        xmin,
        xmax,
        channels: indices.iter().map(|&i| info.channels[i].clone()).collect(),
        first_index,
        last_index: smax,
    })
}

/// Peek at a stream handle directly
pub fn peek_stream(
    stream: &StreamHandle,
    length: f64,
    unit: WindowUnit,
    channels: &ChannelSubset,
) -> BspResult<Chunk> {
    let ring = stream.read();
    extract(&ring, stream.info(), length, unit, channels)
}

/// Peek at the named stream
pub fn peek(
    registry: &StreamRegistry,
    stream_name: &str,
    length: f64,
    unit: WindowUnit,
    channels: &ChannelSubset,
) -> BspResult<Chunk> {
    let stream = registry.get(stream_name)?;
    peek_stream(&stream, length, unit, channels)
}

/// Peek at the named stream, failing if it is no longer the binding `expected`
pub fn peek_bound(
    registry: &StreamRegistry,
    stream_name: &str,
    expected: StreamId,
    length: f64,
    unit: WindowUnit,
    channels: &ChannelSubset,
) -> BspResult<Chunk> {
    let stream = registry.get_bound(stream_name, expected)?;
    peek_stream(&stream, length, unit, channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::SignalKind;

    fn registry_with(capacity: usize, samples: u64, channels: &[&str]) -> StreamRegistry {
        let registry = StreamRegistry::new();
        let info = StreamInfo::new(SignalKind::Eeg, 100.0, channels).unwrap();
        let stream = registry.open("eeg", info, capacity, 16).unwrap();

        let mut data = Vec::new();
        for i in 1..=samples {
            for ch in 0..channels.len() {
                data.push(i as f32 + 1000.0 * ch as f32);
            }
        }
        let block = SignalBlock::new(data, channels.len(), 100.0).unwrap();
        stream.append(&block, &[]).unwrap();
        registry
    }

    #[test]
    fn test_peek_samples_after_wraparound() {
        let registry = registry_with(10, 25, &["C3"]);
        let chunk = peek(&registry, "eeg", 5.0, WindowUnit::Samples, &ChannelSubset::All).unwrap();

        assert_eq!(chunk.data.data(), &[21.0, 22.0, 23.0, 24.0, 25.0]);
        assert_eq!(chunk.first_index, 21);
        assert_eq!(chunk.last_index, 25);
        assert!((chunk.xmax - 0.25).abs() < 1e-9);
        assert!((chunk.xmin - 0.21).abs() < 1e-9);
    }

    #[test]
    fn test_peek_clamps_to_buffer() {
        let registry = registry_with(10, 25, &["C3"]);
        let chunk = peek(&registry, "eeg", 3.0, WindowUnit::Seconds, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.samples(), 10);
        assert_eq!(chunk.first_index, 16);

        let young = registry_with(10, 4, &["C3"]);
        let chunk = peek(&young, "eeg", 50.0, WindowUnit::Samples, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.data.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_peek_seconds_rounds() {
        let registry = registry_with(100, 60, &["C3"]);
        let chunk = peek(&registry, "eeg", 0.126, WindowUnit::Seconds, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.samples(), 13);
    }

    #[test]
    fn test_peek_index_unit() {
        let registry = registry_with(10_000, 5_050, &["C3"]);
        let chunk = peek(&registry, "eeg", 5000.0, WindowUnit::Index, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.samples(), 50);
        assert_eq!(chunk.first_index, 5001);
        assert_eq!(chunk.data.data()[0], 5001.0);

        // Clamped to capacity when the threshold is far behind
        let small = registry_with(100, 5_500, &["C3"]);
        let chunk = peek(&small, "eeg", 5000.0, WindowUnit::Index, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.samples(), 100);
        assert_eq!(chunk.first_index, 5401);

        // Nothing newer than the current head
        let chunk = peek(&small, "eeg", 6000.0, WindowUnit::Index, &ChannelSubset::All).unwrap();
        assert!(chunk.is_empty());
        assert!(chunk.events.is_empty());
    }

    #[test]
    fn test_event_realignment() {
        let registry = StreamRegistry::new();
        let info = StreamInfo::new(SignalKind::Eeg, 100.0, &["C3"]).unwrap();
        let stream = registry.open("eeg", info, 64, 16).unwrap();

        stream.append(&SignalBlock::new(vec![0.0; 100], 1, 100.0).unwrap(), &[]).unwrap();
        stream.append(
            &SignalBlock::new(vec![0.0; 20], 1, 100.0).unwrap(),
            &[Marker::new("cue", 7.0)],
        ).unwrap();

        // Window [100, 120]
        let chunk = peek(&registry, "eeg", 21.0, WindowUnit::Samples, &ChannelSubset::All).unwrap();
        assert_eq!(chunk.first_index, 100);
        assert_eq!(chunk.events.len(), 1);
        assert_eq!(chunk.events[0].latency, 8.0);
    }

    #[test]
    fn test_channel_subset() {
        let registry = registry_with(10, 3, &["C3", "Cz", "C4"]);
        let chunk = peek(
            &registry,
            "eeg",
            2.0,
            WindowUnit::Samples,
            &ChannelSubset::labels(&["C4", "C3"]),
        ).unwrap();
        assert_eq!(chunk.labels(), vec!["C4", "C3"]);
        assert_eq!(chunk.data.data(), &[2002.0, 2.0, 2003.0, 3.0]);
    }

    #[test]
    fn test_argument_errors_are_distinct() {
        let registry = registry_with(10, 3, &["C3"]);

        let unit = "minutes".parse::<WindowUnit>().unwrap_err();
        assert!(matches!(unit, BspError::InvalidArgument { argument: "unit", .. }));

        let length = peek(&registry, "eeg", -1.0, WindowUnit::Samples, &ChannelSubset::All).unwrap_err();
        assert!(matches!(length, BspError::InvalidArgument { argument: "length", .. }));

        let nan = peek(&registry, "eeg", f64::NAN, WindowUnit::Seconds, &ChannelSubset::All).unwrap_err();
        assert!(matches!(nan, BspError::InvalidArgument { argument: "length", .. }));

        let channels = peek(&registry, "eeg", 1.0, WindowUnit::Samples, &ChannelSubset::labels(&["Pz"])).unwrap_err();
        assert!(matches!(channels, BspError::InvalidArgument { argument: "channels", .. }));

        let empty = peek(&registry, "eeg", 1.0, WindowUnit::Samples, &ChannelSubset::Indices(vec![])).unwrap_err();
        assert!(matches!(empty, BspError::InvalidArgument { argument: "channels", .. }));
    }

    #[test]
    fn test_missing_and_stale_streams() {
        let registry = registry_with(10, 3, &["C3"]);
        let missing = peek(&registry, "emg", 1.0, WindowUnit::Samples, &ChannelSubset::All).unwrap_err();
        assert!(matches!(missing, BspError::NotFound { .. }));

        let old_id = registry.get("eeg").unwrap().id();
        let info = StreamInfo::new(SignalKind::Eeg, 100.0, &["C3"]).unwrap();
        registry.open("eeg", info, 10, 4).unwrap();

        let stale = peek_bound(&registry, "eeg", old_id, 1.0, WindowUnit::Samples, &ChannelSubset::All).unwrap_err();
        assert!(matches!(stale, BspError::StaleBinding { .. }));
    }
}
