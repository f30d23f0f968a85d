//! BSP-Online: periodic background prediction on live biosignal streams
//!
//! A predictor couples a calibrated model with the filter pipeline it was
//! trained on. Background tasks update the pipeline at a fixed rate and hand
//! every prediction to a caller-supplied writer.

pub mod background;
pub mod config;
pub mod model;
pub mod predictor;
pub mod scheduler;

pub use background::{
    start_background, BackgroundHandle, BackgroundOptions, BackgroundStats, BackgroundTask,
    ResultWriter,
};
pub use config::{OnlineConfig, SchedulerSettings, StreamSettings};
pub use model::{LinearModel, OutputFormat, OutputValue, PredictionModel};
pub use predictor::{Predictor, PredictorId, PredictorRegistry};
pub use scheduler::{
    PeriodicScheduler, ScheduledTask, SchedulerConfig, SchedulerHandle, SchedulerState,
    SchedulerStats, StopReason, TickOutcome,
};
