//! StreamHandle: one live, named data source and its ring buffer

use crate::error::BspResult;
use crate::marker::Marker;
use crate::ring_buffer::RingBuffer;
use crate::signal_block::SignalBlock;
use crate::stream_info::StreamInfo;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity token of a stream binding.
///
/// A fresh token is issued every time a stream is opened, so replacing the
/// stream registered under a name is observable by anyone holding the old id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        StreamId(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live stream: metadata plus an exclusively owned ring buffer.
///
/// Appends take the write lock, readers take the read lock, so no reader
/// ever observes a partially written frame.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    name: String,
    info: StreamInfo,
    buffer: RwLock<RingBuffer>,
}

impl StreamHandle {
    /// Open a stream with a buffer of `capacity` samples and `marker_capacity` markers
    pub fn new(
        name: &str,
        info: StreamInfo,
        capacity: usize,
        marker_capacity: usize,
    ) -> BspResult<Self> {
        let buffer = RingBuffer::new(
            capacity,
            info.channel_count(),
            info.sampling_rate,
            marker_capacity,
        )?;

        Ok(StreamHandle {
            id: StreamId::new(),
            name: name.to_string(),
            info,
            buffer: RwLock::new(buffer),
        })
    }

    /// Open a stream whose buffer holds `seconds` of data
    pub fn with_buffer_seconds(
        name: &str,
        info: StreamInfo,
        seconds: f32,
        marker_capacity: usize,
    ) -> BspResult<Self> {
        let capacity = (info.sampling_rate * seconds).ceil().max(1.0) as usize;
        Self::new(name, info, capacity, marker_capacity)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn sampling_rate(&self) -> f32 {
        self.info.sampling_rate
    }

    /// Append new samples and markers (marker latencies relative to the block)
    pub fn append(&self, samples: &SignalBlock, markers: &[Marker]) -> BspResult<()> {
        self.buffer.write().append(samples, markers)
    }

    /// Total samples ever written
    pub fn smax(&self) -> u64 {
        self.buffer.read().smax()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.read().capacity()
    }

    /// Read-locked view of the ring for consistent multi-step reads
    pub fn read(&self) -> RwLockReadGuard<'_, RingBuffer> {
        self.buffer.read()
    }

    /// Read the inclusive logical window `[start, end]`
    pub fn read_window(&self, start: u64, end: u64) -> BspResult<SignalBlock> {
        self.buffer.read().read_window(start, end)
    }
}
