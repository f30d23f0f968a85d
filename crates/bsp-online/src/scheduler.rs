//! PeriodicScheduler: a cancellable tokio task ticking at a fixed rate
//!
//! State machine `Created -> Running -> Stopped`. The timer starts after the
//! start delay; each tick runs the task synchronously. A task ends the run by
//! returning [`TickOutcome::Stop`], or from outside through
//! [`SchedulerHandle::cancel`]. Stopped is terminal.

use bsp_core::{BspError, BspResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a scheduler stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Cancelled through its handle
    Cancelled,
    /// The watched stream name now resolves to a different stream
    StreamReplaced { name: String },
    /// The watched stream is gone
    StreamRemoved { name: String },
    /// The watched predictor name now resolves to a different predictor
    PredictorReplaced { name: String },
    /// The watched predictor was deleted
    PredictorRemoved { name: String },
    /// A tick failed; fatal for this run only
    Fault { message: String },
}

impl StopReason {
    pub fn is_fault(&self) -> bool {
        matches!(self, StopReason::Fault { .. })
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::StreamReplaced { name } => write!(f, "stream '{}' was replaced", name),
            StopReason::StreamRemoved { name } => write!(f, "stream '{}' was removed", name),
            StopReason::PredictorReplaced { name } => write!(f, "predictor '{}' was replaced", name),
            StopReason::PredictorRemoved { name } => write!(f, "predictor '{}' was deleted", name),
            StopReason::Fault { message } => write!(f, "fault: {}", message),
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Continue,
    Stop(StopReason),
}

/// Work driven by a [`PeriodicScheduler`]
pub trait ScheduledTask: Send + 'static {
    fn name(&self) -> &str;

    /// Run one tick; must not block on I/O
    fn tick(&mut self) -> TickOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Created,
    Running,
    Stopped,
}

/// Tick timing counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Ticks that took longer than the period
    pub overruns: u64,
    pub total_tick_us: u64,
    pub max_tick_us: u64,
}

impl SchedulerStats {
    pub fn avg_tick_us(&self) -> u64 {
        if self.ticks == 0 {
            0
        } else {
            self.total_tick_us / self.ticks
        }
    }
}

/// Timing configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Tick frequency in Hz
    pub update_freq: f64,
    /// Delay before the first tick
    pub start_delay: Duration,
}

impl SchedulerConfig {
    /// Build from a frequency in Hz and a delay in seconds
    pub fn new(update_freq: f64, start_delay_s: f64) -> BspResult<Self> {
        if !update_freq.is_finite() || update_freq <= 0.0 {
            return Err(BspError::invalid_argument(
                "update_freq",
                format!("{} Hz is not a positive update frequency", update_freq),
            ));
        }
        if !start_delay_s.is_finite() || start_delay_s < 0.0 {
            return Err(BspError::invalid_argument(
                "start_delay",
                format!("{} s is not a valid start delay", start_delay_s),
            ));
        }
        Ok(SchedulerConfig {
            update_freq,
            start_delay: Duration::from_secs_f64(start_delay_s),
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_freq)
    }
}

#[derive(Debug)]
struct Shared {
    state: SchedulerState,
    stats: SchedulerStats,
    stop_reason: Option<StopReason>,
}

/// Spawns scheduled tasks on the current tokio runtime
#[derive(Debug, Clone)]
pub struct PeriodicScheduler {
    config: SchedulerConfig,
    runtime: Handle,
}

impl PeriodicScheduler {
    /// Fails when called outside a tokio runtime
    pub fn new(config: SchedulerConfig) -> BspResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BspError::configuration(format!("periodic scheduling requires a tokio runtime: {}", e))
        })?;
        Ok(PeriodicScheduler { config, runtime })
    }

    /// Start ticking `task`
    pub fn spawn<T: ScheduledTask>(self, task: T) -> SchedulerHandle {
        let name = task.name().to_string();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Mutex::new(Shared {
            state: SchedulerState::Created,
            stats: SchedulerStats::default(),
            stop_reason: None,
        }));

        info!(
            task = %name,
            update_freq = self.config.update_freq,
            start_delay_s = self.config.start_delay.as_secs_f64(),
            "Scheduler created"
        );

        let join = self.runtime.spawn(run(task, self.config, cancel.clone(), Arc::clone(&shared)));

        SchedulerHandle {
            name,
            cancel,
            shared,
            join: Mutex::new(Some(join)),
        }
    }
}

async fn run<T: ScheduledTask>(
    mut task: T,
    config: SchedulerConfig,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
) -> StopReason {
    let reason = drive(&mut task, config, &cancel, &shared).await;

    {
        let mut shared = shared.lock();
        shared.state = SchedulerState::Stopped;
        shared.stop_reason = Some(reason.clone());
    }
    cancel.cancel();

    if reason.is_fault() {
        error!(task = task.name(), %reason, "Scheduler stopped");
    } else {
        info!(task = task.name(), %reason, "Scheduler stopped");
    }
    reason
}

async fn drive<T: ScheduledTask>(
    task: &mut T,
    config: SchedulerConfig,
    cancel: &CancellationToken,
    shared: &Mutex<Shared>,
) -> StopReason {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return StopReason::Cancelled,
        _ = sleep(config.start_delay) => {}
    }

    let period = config.period();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    shared.lock().state = SchedulerState::Running;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StopReason::Cancelled,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let outcome = task.tick();
        let elapsed = started.elapsed();
        let elapsed_us = elapsed.as_micros() as u64;

        {
            let mut shared = shared.lock();
            let stats = &mut shared.stats;
            stats.ticks += 1;
            stats.total_tick_us += elapsed_us;
            stats.max_tick_us = stats.max_tick_us.max(elapsed_us);
            if elapsed > period {
                stats.overruns += 1;
                warn!(
                    task = task.name(),
                    elapsed_us,
                    period_us = period.as_micros() as u64,
                    overruns = stats.overruns,
                    "Tick overran its period; next ticks are skipped"
                );
            }
        }
        debug!(task = task.name(), elapsed_us, "Tick done");

        if let TickOutcome::Stop(reason) = outcome {
            return reason;
        }
    }
}

/// Handle to a running scheduler
#[derive(Debug)]
pub struct SchedulerHandle {
    name: String,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
    join: Mutex<Option<JoinHandle<StopReason>>>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SchedulerState::Stopped
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats.clone()
    }

    /// Reason the scheduler stopped, once it has
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.lock().stop_reason.clone()
    }

    /// Request termination; a no-op once stopped
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(task = %self.name, "Scheduler cancellation requested");
            self.cancel.cancel();
        }
    }

    /// Wait for the scheduler to stop
    pub async fn join(&self) -> StopReason {
        let join = self.join.lock().take();
        match join {
            Some(join) => match join.await {
                Ok(reason) => reason,
                Err(e) => StopReason::Fault {
                    message: format!("scheduler task ended abnormally: {}", e),
                },
            },
            None => {
                // Another caller took the join handle; wait on the token instead
                self.cancel.cancelled().await;
                self.stop_reason().unwrap_or(StopReason::Cancelled)
            }
        }
    }
}
