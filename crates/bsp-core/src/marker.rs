//! Event markers attached to stream samples

use serde::{Deserialize, Serialize};

/// An event marker.
///
/// `latency` is a 1-based sample position that may carry a fractional part.
/// Its origin depends on context: relative to an appended block on input,
/// absolute inside a ring buffer, relative to the window start inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Event type label
    pub kind: String,
    /// Position in samples (1-based)
    pub latency: f64,
    /// Duration in samples
    #[serde(default)]
    pub duration: f64,
}

impl Marker {
    pub fn new(kind: &str, latency: f64) -> Self {
        Marker {
            kind: kind.to_string(),
            latency,
            duration: 0.0,
        }
    }

    /// Integer sample the marker is attached to
    pub fn sample_position(&self) -> u64 {
        self.latency.floor().max(0.0) as u64
    }

    /// Same marker with its latency shifted by `offset` samples
    pub fn shifted(&self, offset: f64) -> Marker {
        Marker {
            kind: self.kind.clone(),
            latency: self.latency + offset,
            duration: self.duration,
        }
    }
}
