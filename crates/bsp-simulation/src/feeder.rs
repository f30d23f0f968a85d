//! Tokio task appending simulated EEG chunks to a live stream

use crate::eeg_simulator::{EegConfig, EegSimulator};
use crate::signal_patterns::SignalPattern;
use bsp_core::{BspError, BspResult, StreamHandle};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the stream feeder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    /// EEG simulation configuration
    pub simulator: EegConfig,
    /// Append rate in Hz (how often a chunk is pushed)
    pub update_rate: f32,
    /// Relative chunk size variation in [0, 1); 0 gives equal chunks
    pub jitter: f32,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            simulator: EegConfig::default(),
            update_rate: 20.0,
            jitter: 0.3,
        }
    }
}

impl FeederConfig {
    /// Validate configuration
    pub fn validate(&self) -> BspResult<()> {
        self.simulator.validate()?;
        if !self.update_rate.is_finite() || self.update_rate <= 0.0 {
            return Err(BspError::configuration("feeder update rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(BspError::configuration("feeder jitter must lie in [0, 1)"));
        }
        Ok(())
    }
}

/// Commands for controlling the feeder
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Start,
    Pause,
    Resume,
    Stop,
    UpdatePattern(SignalPattern),
}

/// Feeder statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeederStats {
    pub chunks_appended: u64,
    pub samples_appended: u64,
    pub markers_appended: u64,
    pub append_failures: u64,
}

/// Appends irregularly sized simulated chunks to a stream
pub struct StreamFeeder {
    config: FeederConfig,
    stream: Arc<StreamHandle>,
    simulator: EegSimulator,
    jitter_rng: rand::rngs::StdRng,
    control_receiver: mpsc::Receiver<StreamCommand>,
    running: bool,
    stats: FeederStats,
}

impl StreamFeeder {
    /// Create a feeder and its control channel
    pub fn new(
        stream: Arc<StreamHandle>,
        config: FeederConfig,
    ) -> BspResult<(Self, mpsc::Sender<StreamCommand>)> {
        config.validate()?;

        let info = config.simulator.stream_info()?;
        if info.labels() != stream.info().labels() || info.sampling_rate != stream.sampling_rate() {
            return Err(BspError::shape(
                format!("simulated layout for stream '{}'", stream.name()),
                stream.info().channel_count(),
                info.channel_count(),
            ));
        }

        let jitter_rng = match config.simulator.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let simulator = EegSimulator::new(config.simulator.clone())?;
        let (control_sender, control_receiver) = mpsc::channel(32);

        Ok((
            StreamFeeder {
                config,
                stream,
                simulator,
                jitter_rng,
                control_receiver,
                running: false,
                stats: FeederStats::default(),
            },
            control_sender,
        ))
    }

    fn next_chunk_size(&mut self) -> usize {
        let nominal = self.config.simulator.sampling_rate / self.config.update_rate;
        let factor = if self.config.jitter > 0.0 {
            1.0 + self.jitter_rng.gen_range(-self.config.jitter..self.config.jitter)
        } else {
            1.0
        };
        (nominal * factor).round() as usize
    }

    fn append_chunk(&mut self) -> BspResult<()> {
        let samples = self.next_chunk_size();
        if samples == 0 {
            return Ok(());
        }
        let (block, markers) = self.simulator.generate(samples)?;
        self.stream.append(&block, &markers)?;

        self.stats.chunks_appended += 1;
        self.stats.samples_appended += samples as u64;
        self.stats.markers_appended += markers.len() as u64;
        debug!(
            stream = self.stream.name(),
            samples,
            markers = markers.len(),
            smax = self.stream.smax(),
            "Appended simulated chunk"
        );
        Ok(())
    }

    /// Run until `Stop` is received or every control sender is dropped
    pub async fn run(mut self) -> FeederStats {
        let period = Duration::from_secs_f32(1.0 / self.config.update_rate);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stream = self.stream.name(),
            update_rate = self.config.update_rate,
            "Stream feeder ready"
        );

        loop {
            tokio::select! {
                biased;

                command = self.control_receiver.recv() => {
                    match command {
                        Some(StreamCommand::Start) | Some(StreamCommand::Resume) => {
                            self.running = true;
                            info!(stream = self.stream.name(), "Stream feeder running");
                        }
                        Some(StreamCommand::Pause) => {
                            self.running = false;
                            info!(stream = self.stream.name(), "Stream feeder paused");
                        }
                        Some(StreamCommand::UpdatePattern(pattern)) => {
                            info!(stream = self.stream.name(), pattern = pattern.description(), "Stream feeder pattern updated");
                            self.simulator.set_pattern(pattern);
                        }
                        Some(StreamCommand::Stop) | None => {
                            info!(
                                stream = self.stream.name(),
                                chunks = self.stats.chunks_appended,
                                samples = self.stats.samples_appended,
                                "Stream feeder stopped"
                            );
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.running {
                        if let Err(e) = self.append_chunk() {
                            self.stats.append_failures += 1;
                            warn!(stream = self.stream.name(), error = %e, "Failed to append simulated chunk");
                        }
                    }
                }
            }
        }

        self.stats
    }
}

/// Spawn a feeder for `stream` in the background
pub fn start_feeder(
    stream: Arc<StreamHandle>,
    config: FeederConfig,
) -> BspResult<(mpsc::Sender<StreamCommand>, JoinHandle<FeederStats>)> {
    let (feeder, control_sender) = StreamFeeder::new(stream, config)?;
    let handle = tokio::spawn(feeder.run());
    Ok((control_sender, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsp_core::StreamRegistry;
    use tokio::time::sleep;

    fn setup(config: &FeederConfig) -> Arc<StreamHandle> {
        let registry = StreamRegistry::new();
        registry
            .open("eeg", config.simulator.stream_info().unwrap(), 2500, 64)
            .unwrap()
    }

    fn config() -> FeederConfig {
        FeederConfig {
            simulator: EegConfig {
                seed: Some(3),
                ..Default::default()
            },
            update_rate: 10.0,
            jitter: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeder_appends_after_start() {
        let config = config();
        let stream = setup(&config);
        let (control, handle) = start_feeder(Arc::clone(&stream), config).unwrap();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(stream.smax(), 0);

        control.send(StreamCommand::Start).await.unwrap();
        sleep(Duration::from_millis(1050)).await;
        assert!(stream.smax() > 0);
        assert_eq!(stream.smax() % 25, 0);

        control.send(StreamCommand::Stop).await.unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.samples_appended, stream.smax());
        assert_eq!(stats.append_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let config = config();
        let stream = setup(&config);
        let (control, handle) = start_feeder(Arc::clone(&stream), config).unwrap();

        control.send(StreamCommand::Start).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        control.send(StreamCommand::Pause).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        let paused_at = stream.smax();
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(stream.smax(), paused_at);

        control.send(StreamCommand::Resume).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        assert!(stream.smax() > paused_at);

        drop(control);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_chunks_stay_near_nominal() {
        let mut config = config();
        config.jitter = 0.5;
        let stream = setup(&config);
        let (control, handle) = start_feeder(Arc::clone(&stream), config).unwrap();

        control.send(StreamCommand::Start).await.unwrap();
        sleep(Duration::from_millis(2000)).await;
        control.send(StreamCommand::Stop).await.unwrap();

        let stats = handle.await.unwrap();
        assert!(stats.chunks_appended >= 10);
        let mean = stats.samples_appended as f32 / stats.chunks_appended as f32;
        assert!((12.0..=38.0).contains(&mean));
    }

    #[test]
    fn test_layout_mismatch() {
        let config = config();
        let registry = StreamRegistry::new();
        let info = bsp_core::StreamInfo::new(bsp_core::SignalKind::Eeg, 250.0, &["C3"]).unwrap();
        let stream = registry.open("eeg", info, 100, 8).unwrap();
        assert!(matches!(
            StreamFeeder::new(stream, config),
            Err(BspError::Shape { .. })
        ));
    }
}
