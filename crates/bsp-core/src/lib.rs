//! BSP-Core: Foundation types for online biosignal processing
//!
//! Streams, their circular sample buffers, the name-keyed stream registry
//! and window extraction over buffered history.

pub mod error;
pub mod marker;
pub mod registry;
pub mod ring_buffer;
pub mod signal_block;
pub mod stream;
pub mod stream_info;
pub mod window;

pub use error::{BspError, BspResult};
pub use marker::Marker;
pub use registry::StreamRegistry;
pub use ring_buffer::RingBuffer;
pub use signal_block::{ChannelStats, SignalBlock};
pub use stream::{StreamHandle, StreamId};
pub use stream_info::{ChannelLocation, SignalKind, StreamInfo};
pub use window::{extract, peek, peek_bound, peek_stream, samples_to_get, ChannelSubset, Chunk, WindowUnit};
