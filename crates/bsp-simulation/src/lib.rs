//! BSP-Simulation: synthetic EEG sources for tests and demos
//!
//! Generates multichannel EEG with a modulated alpha rhythm and feeds it into
//! live streams in irregular chunks.

pub mod eeg_simulator;
pub mod feeder;
pub mod signal_patterns;

pub use eeg_simulator::{EegConfig, EegSimulator, MarkerConfig, NoiseConfig};
pub use feeder::{start_feeder, FeederConfig, FeederStats, StreamCommand, StreamFeeder};
pub use signal_patterns::SignalPattern;
