//! EEG stream metadata: sampling rate, channel labels and locations

use crate::error::{BspError, BspResult};
use serde::{Deserialize, Serialize};

/// Kind of signal carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Scalp EEG
    Eeg,
    /// Intracranial / ECoG recordings
    Ecog,
    /// Derived signal (pipeline output, features)
    Derived,
    /// Anything else
    Other,
}

/// 3-D position of an electrode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLocation {
    pub label: String,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
}

impl ChannelLocation {
    /// Location entry that only carries a label
    pub fn unplaced(label: &str) -> Self {
        ChannelLocation {
            label: label.to_string(),
            x: None,
            y: None,
            z: None,
        }
    }
}

/// Static description of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Type of signal
    pub kind: SignalKind,
    /// Sampling rate in Hz
    pub sampling_rate: f32,
    /// Channel locations, one per channel (labels are taken from here)
    pub channels: Vec<ChannelLocation>,
}

impl StreamInfo {
    /// Create stream metadata from channel labels
    pub fn new(kind: SignalKind, sampling_rate: f32, labels: &[&str]) -> BspResult<Self> {
        let channels = labels.iter().map(|l| ChannelLocation::unplaced(l)).collect();
        Self::with_locations(kind, sampling_rate, channels)
    }

    /// Create stream metadata from full channel locations
    pub fn with_locations(
        kind: SignalKind,
        sampling_rate: f32,
        channels: Vec<ChannelLocation>,
    ) -> BspResult<Self> {
        Self::validate_sampling_rate(sampling_rate)?;
        Self::validate_channel_count(channels.len())?;

        for (i, channel) in channels.iter().enumerate() {
            if channel.label.is_empty() {
                return Err(BspError::invalid_argument(
                    "channels",
                    format!("channel {} has an empty label", i),
                ));
            }
            if channels[..i].iter().any(|c| c.label == channel.label) {
                return Err(BspError::invalid_argument(
                    "channels",
                    format!("duplicate channel label '{}'", channel.label),
                ));
            }
        }

        Ok(StreamInfo {
            kind,
            sampling_rate,
            channels,
        })
    }

    /// Validate sampling rate
    pub fn validate_sampling_rate(rate: f32) -> BspResult<()> {
        if !rate.is_finite() || rate <= 0.0 {
            Err(BspError::invalid_argument(
                "sampling_rate",
                format!("{} Hz is not a positive, finite rate", rate),
            ))
        } else {
            Ok(())
        }
    }

    /// Validate channel count
    pub fn validate_channel_count(count: usize) -> BspResult<()> {
        const MAX_CHANNELS: usize = 1024;

        if count == 0 || count > MAX_CHANNELS {
            Err(BspError::invalid_argument(
                "channels",
                format!("channel count {} outside 1-{}", count, MAX_CHANNELS),
            ))
        } else {
            Ok(())
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel labels in stream order
    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    /// Index of a channel by label
    pub fn channel_index(&self, label: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.label == label)
    }

    /// True if every label in `required` is present in this stream
    pub fn contains_all<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required
            .iter()
            .all(|label| self.channel_index(label.as_ref()).is_some())
    }

    /// Metadata restricted to the given channel indices
    pub fn select(&self, indices: &[usize]) -> StreamInfo {
        StreamInfo {
            kind: self.kind,
            sampling_rate: self.sampling_rate,
            channels: indices.iter().map(|&i| self.channels[i].clone()).collect(),
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Eeg => write!(f, "EEG"),
            SignalKind::Ecog => write!(f, "ECoG"),
            SignalKind::Derived => write!(f, "Derived"),
            SignalKind::Other => write!(f, "Other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_creation() {
        let info = StreamInfo::new(SignalKind::Eeg, 250.0, &["C3", "Cz", "C4"]).unwrap();
        assert_eq!(info.channel_count(), 3);
        assert_eq!(info.channel_index("Cz"), Some(1));
        assert!(info.contains_all(&["C4", "C3"]));
        assert!(!info.contains_all(&["C3", "Pz"]));
    }

    #[test]
    fn test_invalid_info() {
        assert!(StreamInfo::new(SignalKind::Eeg, 0.0, &["C3"]).is_err());
        assert!(StreamInfo::new(SignalKind::Eeg, 250.0, &[]).is_err());
        let dup = StreamInfo::new(SignalKind::Eeg, 250.0, &["C3", "C3"]);
        assert!(matches!(dup, Err(BspError::InvalidArgument { argument: "channels", .. })));
    }
}
