use anyhow::{Context, Result};
use bsp_core::StreamRegistry;
use bsp_online::{
    start_background, LinearModel, OnlineConfig, OutputFormat, OutputValue, PredictionModel,
    PredictorRegistry,
};
use bsp_processing::{FilterExpr, OperatorConfig};
use bsp_simulation::{start_feeder, StreamCommand};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bsp-online")]
#[command(version, about = "Run a calibrated predictor on a simulated live EEG stream")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model file (JSON); overrides the configuration
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Prediction rate in Hz
    #[arg(long)]
    update_freq: Option<f64>,

    /// distribution, expectation or mode
    #[arg(long)]
    output_format: Option<OutputFormat>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<OnlineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            OnlineConfig::from_json(&json)?
        }
        None => OnlineConfig::default(),
    };

    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if let Some(freq) = cli.update_freq {
        config.scheduler.update_freq = freq;
    }
    if let Some(format) = cli.output_format {
        config.scheduler.output_format = format;
    }
    if let Some(duration) = cli.duration {
        config.duration = Some(duration);
    }
    config.validate()?;
    Ok(config)
}

/// Occipital alpha power detector: relaxed when alpha is high
fn alpha_model(srate: f32) -> LinearModel {
    let channels = ["O1", "O2", "C3"];
    let filter = FilterExpr::raw(&channels, Some(srate))
        .then(OperatorConfig::new("highpass").with("cutoff", 1.0))
        .then(
            OperatorConfig::new("band_power")
                .with("low", 8.0)
                .with("high", 12.0)
                .with("window", (srate as usize).max(1))
                .with("hop", (srate as usize / 10).max(1)),
        );

    LinearModel {
        name: "alpha".to_string(),
        filter,
        channels: channels.iter().map(|c| c.to_string()).collect(),
        window: 0.5,
        classes: vec!["alert".to_string(), "relaxed".to_string()],
        weights: vec![vec![-0.5, -0.5, 1.0], vec![0.5, 0.5, -1.0]],
        bias: vec![0.0, 0.0],
    }
}

fn load_model(config: &OnlineConfig) -> Result<LinearModel> {
    match &config.model {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read model file {}", path.display()))?;
            Ok(LinearModel::from_json(&json)?)
        }
        None => Ok(alpha_model(config.source.simulator.sampling_rate)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "bsp_online=debug,bsp_processing=debug,bsp_simulation=debug"
    } else {
        "bsp_online=info,bsp_processing=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;
    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let streams = Arc::new(StreamRegistry::new());
    let predictors = Arc::new(PredictorRegistry::new());

    let info = config.source.simulator.stream_info()?;
    let capacity = (config.stream.buffer_seconds * info.sampling_rate).ceil().max(1.0) as usize;
    let stream = streams.open(&config.stream.name, info, capacity, config.stream.marker_capacity)?;

    let (feeder, feeder_task) = start_feeder(Arc::clone(&stream), config.source.clone())?;
    feeder
        .send(StreamCommand::Start)
        .await
        .context("Feeder stopped before it was started")?;

    let model: Arc<dyn PredictionModel> = Arc::new(load_model(&config)?);
    info!(
        model = model.name(),
        stream = %config.stream.name,
        classes = ?model.classes(),
        "Model loaded"
    );

    let handle = start_background(
        |value: OutputValue| -> Result<()> {
            match &value {
                OutputValue::Distribution(p) => info!(distribution = ?p, "Prediction"),
                OutputValue::Expectation(x) => info!(expectation = x, "Prediction"),
                OutputValue::Mode(class) => info!(class = %class, "Prediction"),
                OutputValue::Empty => info!("Prediction unavailable"),
            }
            Ok(())
        },
        Arc::clone(&streams),
        Arc::clone(&predictors),
        &config.stream.name,
        model,
        config.background_options(),
    )?;

    match config.duration {
        Some(seconds) => {
            tokio::select! {
                _ = sleep(Duration::from_secs_f64(seconds)) => info!("Run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
            info!("Interrupted");
        }
    }

    handle.cancel();
    let reason = handle.join().await;
    let stats = handle.stats();
    let timing = handle.scheduler_stats();
    info!(
        reason = ?reason,
        ticks = timing.ticks,
        avg_tick_us = timing.avg_tick_us(),
        predictions = stats.predictions,
        empty = stats.empty_results,
        dropped_samples = stats.dropped_samples,
        "Background prediction stopped"
    );
    if let Ok(predictor) = predictors.get(handle.predictor_name()) {
        info!(performance = ?predictor.performance_summary(), "Pipeline summary");
    }

    if feeder.send(StreamCommand::Stop).await.is_err() {
        warn!("Feeder already stopped");
    }
    let feeder_stats = feeder_task.await.context("Feeder task panicked")?;
    info!(
        chunks = feeder_stats.chunks_appended,
        samples = feeder_stats.samples_appended,
        markers = feeder_stats.markers_appended,
        "Feeder stopped"
    );

    Ok(())
}
