//! Background prediction: a predictor evaluated periodically, results handed to a writer

use crate::model::{OutputFormat, OutputValue, PredictionModel};
use crate::predictor::{Predictor, PredictorId, PredictorRegistry};
use crate::scheduler::{
    PeriodicScheduler, ScheduledTask, SchedulerConfig, SchedulerHandle, SchedulerState,
    SchedulerStats, StopReason, TickOutcome,
};
use bsp_core::{BspError, BspResult, StreamId, StreamRegistry};
use bsp_processing::PipelineConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Consumer of background predictions
pub type ResultWriter = Box<dyn FnMut(OutputValue) -> anyhow::Result<()> + Send>;

/// Options of [`start_background`]
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundOptions {
    pub output_format: OutputFormat,
    /// Prediction rate in Hz
    pub update_freq: f64,
    /// Seconds before the first prediction
    pub start_delay: f64,
    /// Name the predictor is registered under
    pub predictor_name: String,
    /// When non-empty, predict only on ticks whose new data carries one of these marker types
    pub predict_at_markers: Vec<String>,
    /// Written on idle ticks and when no prediction could be made; nothing is written when `None`
    pub empty_value: Option<OutputValue>,
    pub pipeline: PipelineConfig,
}

impl Default for BackgroundOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Distribution,
            update_freq: 10.0,
            start_delay: 1.0,
            predictor_name: "lastpredictor".to_string(),
            predict_at_markers: Vec::new(),
            empty_value: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Counters of a background task
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackgroundStats {
    pub predictions: u64,
    pub empty_results: u64,
    /// Ticks skipped because no requested marker arrived
    pub marker_skips: u64,
    pub writer_failures: u64,
    pub dropped_samples: u64,
}

/// One predictor watched and evaluated on every tick
pub struct BackgroundTask {
    label: String,
    streams: Arc<StreamRegistry>,
    predictors: Arc<PredictorRegistry>,
    stream_name: String,
    stream_id: StreamId,
    predictor_name: String,
    predictor_id: PredictorId,
    output_format: OutputFormat,
    predict_at_markers: Vec<String>,
    empty_value: Option<OutputValue>,
    writer: ResultWriter,
    stats: Arc<Mutex<BackgroundStats>>,
}

impl BackgroundTask {
    /// Watch `predictor` and the stream it reads, capturing both identities now
    pub fn new(
        writer: ResultWriter,
        streams: Arc<StreamRegistry>,
        predictors: Arc<PredictorRegistry>,
        stream_name: &str,
        predictor: &Predictor,
        options: &BackgroundOptions,
    ) -> BspResult<Self> {
        let stream_id = streams.get(stream_name)?.id();

        Ok(BackgroundTask {
            label: format!("background:{}", predictor.name()),
            streams,
            predictors,
            stream_name: stream_name.to_string(),
            stream_id,
            predictor_name: predictor.name().to_string(),
            predictor_id: predictor.id(),
            output_format: options.output_format,
            predict_at_markers: options.predict_at_markers.clone(),
            empty_value: options.empty_value.clone(),
            writer,
            stats: Arc::new(Mutex::new(BackgroundStats::default())),
        })
    }

    pub fn stats(&self) -> BackgroundStats {
        self.stats.lock().clone()
    }

    fn live_predictor(&self) -> Result<Arc<Predictor>, StopReason> {
        match self.streams.get_bound(&self.stream_name, self.stream_id) {
            Ok(_) => {}
            Err(BspError::NotFound { .. }) => {
                return Err(StopReason::StreamRemoved { name: self.stream_name.clone() })
            }
            Err(BspError::StaleBinding { .. }) => {
                return Err(StopReason::StreamReplaced { name: self.stream_name.clone() })
            }
            Err(e) => return Err(StopReason::Fault { message: e.to_string() }),
        }

        self.predictors
            .get_bound(&self.predictor_name, self.predictor_id)
            .map_err(|e| match e {
                BspError::NotFound { .. } => StopReason::PredictorRemoved {
                    name: self.predictor_name.clone(),
                },
                BspError::StaleBinding { .. } => StopReason::PredictorReplaced {
                    name: self.predictor_name.clone(),
                },
                other => StopReason::Fault { message: other.to_string() },
            })
    }

    fn write_empty(&mut self) {
        self.stats.lock().empty_results += 1;
        if let Some(value) = self.empty_value.clone() {
            self.write(value);
        }
    }

    fn write(&mut self, value: OutputValue) {
        let writer = &mut self.writer;
        match catch_unwind(AssertUnwindSafe(|| writer(value))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.lock().writer_failures += 1;
                warn!(task = %self.label, error = %format!("{:#}", e), "Result writer failed");
            }
            Err(_panic) => {
                self.stats.lock().writer_failures += 1;
                error!(task = %self.label, "Result writer panicked");
            }
        }
    }
}

impl ScheduledTask for BackgroundTask {
    fn name(&self) -> &str {
        &self.label
    }

    fn tick(&mut self) -> TickOutcome {
        let predictor = match self.live_predictor() {
            Ok(predictor) => predictor,
            Err(reason) => return TickOutcome::Stop(reason),
        };

        let update = match predictor.update() {
            Ok(update) => update,
            Err(e) => return TickOutcome::Stop(StopReason::Fault { message: e.to_string() }),
        };
        self.stats.lock().dropped_samples += update.dropped_samples;

        if !self.predict_at_markers.is_empty()
            && !update
                .input_markers
                .iter()
                .any(|m| self.predict_at_markers.contains(&m.kind))
        {
            self.stats.lock().marker_skips += 1;
            return TickOutcome::Continue;
        }

        // An idle tick yields the empty result
        let prediction = if update.is_idle() {
            None
        } else {
            match predictor.predict(self.output_format) {
                Ok(prediction) => prediction,
                Err(e) => return TickOutcome::Stop(StopReason::Fault { message: e.to_string() }),
            }
        };

        match prediction {
            Some(value) => {
                self.stats.lock().predictions += 1;
                debug!(task = %self.label, ?value, "Prediction");
                self.write(value);
            }
            None => self.write_empty(),
        }

        TickOutcome::Continue
    }
}

/// Handle to a background prediction task
#[derive(Debug)]
pub struct BackgroundHandle {
    scheduler: SchedulerHandle,
    predictor_name: String,
    predictor_id: PredictorId,
    stats: Arc<Mutex<BackgroundStats>>,
}

impl BackgroundHandle {
    pub fn predictor_name(&self) -> &str {
        &self.predictor_name
    }

    pub fn predictor_id(&self) -> PredictorId {
        self.predictor_id
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    pub fn stats(&self) -> BackgroundStats {
        self.stats.lock().clone()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.scheduler.stop_reason()
    }

    /// Stop the task; a no-op once stopped
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    /// Wait for the task to stop
    pub async fn join(&self) -> StopReason {
        self.scheduler.join().await
    }
}

/// Create a predictor for `model` on `stream_name` and run it periodically,
/// handing every result to `writer`.
///
/// The predictor is registered under `options.predictor_name`, replacing any
/// previous binding of that name. The task stops by itself once the stream or
/// the predictor is replaced or removed.
pub fn start_background<W>(
    writer: W,
    streams: Arc<StreamRegistry>,
    predictors: Arc<PredictorRegistry>,
    stream_name: &str,
    model: Arc<dyn PredictionModel>,
    options: BackgroundOptions,
) -> BspResult<BackgroundHandle>
where
    W: FnMut(OutputValue) -> anyhow::Result<()> + Send + 'static,
{
    let scheduler = PeriodicScheduler::new(SchedulerConfig::new(options.update_freq, options.start_delay)?)?;
    if options.predictor_name.is_empty() {
        return Err(BspError::invalid_argument("predictor_name", "predictor name cannot be empty"));
    }

    let predictor = Arc::new(Predictor::new(
        &options.predictor_name,
        model,
        Arc::clone(&streams),
        &[stream_name],
        options.pipeline.clone(),
    )?);
    let task = BackgroundTask::new(
        Box::new(writer),
        streams,
        Arc::clone(&predictors),
        stream_name,
        &predictor,
        &options,
    )?;
    let stats = Arc::clone(&task.stats);
    let predictor_id = predictor.id();

    predictors.insert(predictor);
    info!(
        predictor = %options.predictor_name,
        stream = stream_name,
        format = %options.output_format,
        update_freq = options.update_freq,
        "Background prediction started"
    );

    Ok(BackgroundHandle {
        scheduler: scheduler.spawn(task),
        predictor_name: options.predictor_name,
        predictor_id,
        stats,
    })
}
