//! Online pipeline: a bound filter graph plus its bounded output ring

use crate::catalog::OperatorCatalog;
use crate::config::PipelineConfig;
use crate::evaluator::{evaluate, TickOutput};
use crate::expr::FilterExpr;
use crate::graph::{NodeMetrics, PipelineGraph};
use bsp_core::{
    extract, BspError, BspResult, ChannelSubset, Chunk, RingBuffer, StreamId, StreamInfo,
    StreamRegistry, WindowUnit,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity token of a pipeline instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn new() -> Self {
        PipelineId(Uuid::new_v4())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Running counters of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct PipelineStats {
    ticks: u64,
    idle_ticks: u64,
    failed_ticks: u64,
    total_tick_us: u64,
    max_tick_us: u64,
    dropped_samples: u64,
    samples_out: u64,
}

/// Per-node entry of the performance summary
#[derive(Debug, Clone, Serialize)]
pub struct NodePerformance {
    pub label: String,
    pub operator: String,
    pub stateful: bool,
    pub metrics: NodeMetrics,
    pub avg_time_us: u64,
}

/// Pipeline performance summary
#[derive(Debug, Clone, Serialize)]
pub struct PipelinePerformance {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub failed_ticks: u64,
    pub avg_tick_us: u64,
    pub max_tick_us: u64,
    pub dropped_samples: u64,
    pub samples_out: u64,
    pub success_rate: f32,
    pub nodes: Vec<NodePerformance>,
}

/// A filter graph bound to live streams, evaluated incrementally
pub struct Pipeline {
    id: PipelineId,
    name: String,
    graph: PipelineGraph,
    registry: Arc<StreamRegistry>,
    config: PipelineConfig,
    output: RingBuffer,
    output_info: StreamInfo,
    stats: PipelineStats,
}

impl Pipeline {
    fn from_graph(
        name: String,
        graph: PipelineGraph,
        registry: Arc<StreamRegistry>,
        config: PipelineConfig,
    ) -> BspResult<Self> {
        let output_info = graph.output_layout().clone();
        let output = RingBuffer::new(
            config.output_capacity,
            output_info.channel_count(),
            output_info.sampling_rate,
            config.output_marker_capacity,
        )?;

        let pipeline = Pipeline {
            id: PipelineId::new(),
            name,
            graph,
            registry,
            config,
            output,
            output_info,
            stats: PipelineStats::default(),
        };

        info!(
            pipeline = %pipeline.name,
            id = %pipeline.id,
            nodes = pipeline.graph.len(),
            output_channels = pipeline.output_info.channel_count(),
            output_srate = pipeline.output_info.sampling_rate,
            "Pipeline created"
        );
        Ok(pipeline)
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get layout of the pipeline output
    pub fn output_info(&self) -> &StreamInfo {
        &self.output_info
    }

    /// Get total number of output samples ever produced
    pub fn output_smax(&self) -> u64 {
        self.output.smax()
    }

    /// Streams the graph's leaves are bound to, with their identity at binding time
    pub fn bound_streams(&self) -> Vec<(String, StreamId)> {
        self.graph.bound_streams()
    }

    /// True while every bound stream is still registered under its original identity
    pub fn bindings_alive(&self) -> bool {
        self.graph
            .bound_streams()
            .iter()
            .all(|(name, id)| self.registry.get_bound(name, *id).is_ok())
    }

    /// Evaluate one tick and append the new root samples to the output ring
    pub fn update(&mut self) -> BspResult<TickOutput> {
        self.stats.ticks += 1;

        let tick = match evaluate(&mut self.graph, &self.registry, &self.config) {
            Ok(tick) => tick,
            Err(e) => {
                self.stats.failed_ticks += 1;
                warn!(pipeline = %self.name, error = %e, "Pipeline tick failed");
                return Err(e);
            }
        };

        if !tick.samples.is_empty() {
            if let Err(e) = self.output.append(&tick.samples, &tick.markers) {
                self.stats.failed_ticks += 1;
                return Err(e);
            }
        }

        self.stats.total_tick_us += tick.elapsed_us;
        self.stats.max_tick_us = self.stats.max_tick_us.max(tick.elapsed_us);
        self.stats.dropped_samples += tick.dropped_samples;
        self.stats.samples_out += tick.samples.samples() as u64;
        if tick.is_idle() {
            self.stats.idle_ticks += 1;
        }

        Ok(tick)
    }

    /// Window of the pipeline output, with the same arithmetic as a stream peek
    pub fn peek_output(
        &self,
        length: f64,
        unit: WindowUnit,
        channels: &ChannelSubset,
    ) -> BspResult<Chunk> {
        extract(&self.output, &self.output_info, length, unit, channels)
    }

    /// Get pipeline performance summary
    pub fn performance_summary(&self) -> PipelinePerformance {
        let succeeded = self.stats.ticks - self.stats.failed_ticks;
        let success_rate = if self.stats.ticks == 0 {
            1.0
        } else {
            succeeded as f32 / self.stats.ticks as f32
        };
        let avg_tick_us = if succeeded == 0 {
            0
        } else {
            self.stats.total_tick_us / succeeded
        };

        let nodes = self
            .graph
            .order()
            .iter()
            .map(|&id| {
                let node = self.graph.node(id);
                NodePerformance {
                    label: node.label.clone(),
                    operator: node.operator_name().to_string(),
                    stateful: node.kind.is_stateful(),
                    metrics: node.metrics.clone(),
                    avg_time_us: node.metrics.avg_time_us(),
                }
            })
            .collect();

        PipelinePerformance {
            ticks: self.stats.ticks,
            idle_ticks: self.stats.idle_ticks,
            failed_ticks: self.stats.failed_ticks,
            avg_tick_us,
            max_tick_us: self.stats.max_tick_us,
            dropped_samples: self.stats.dropped_samples,
            samples_out: self.stats.samples_out,
            success_rate,
            nodes,
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.graph.len())
            .field("output_smax", &self.output.smax())
            .finish()
    }
}

/// Pipeline builder
pub struct PipelineBuilder {
    expr: FilterExpr,
    name: String,
    streams: Vec<String>,
    needed_channels: Vec<String>,
    config: PipelineConfig,
    catalog: Option<OperatorCatalog>,
}

impl PipelineBuilder {
    pub fn new(expr: FilterExpr) -> Self {
        PipelineBuilder {
            expr,
            name: "pipeline".to_string(),
            streams: Vec::new(),
            needed_channels: Vec::new(),
            config: PipelineConfig::default(),
            catalog: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Restrict leaf binding to these streams (all registered streams when empty)
    pub fn streams<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.streams = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Channels the consumer actually needs from the output
    pub fn needed_channels<S: AsRef<str>>(mut self, channels: &[S]) -> Self {
        self.needed_channels = channels.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: OperatorCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Bind the expression against `registry` and build the pipeline
    pub fn build(self, registry: Arc<StreamRegistry>) -> BspResult<Pipeline> {
        self.config.validate()?;
        self.expr.validate()?;
        if self.name.is_empty() {
            return Err(BspError::invalid_argument("name", "pipeline name must not be empty"));
        }

        let catalog = self.catalog.unwrap_or_default();
        let graph = PipelineGraph::build(
            &self.expr,
            &registry,
            &self.streams,
            &self.needed_channels,
            &catalog,
        )?;

        Pipeline::from_graph(self.name, graph, registry, self.config)
    }
}

/// Build a pipeline with default configuration and the built-in operators
pub fn new_pipeline<S: AsRef<str>, N: AsRef<str>>(
    registry: Arc<StreamRegistry>,
    expr: &FilterExpr,
    stream_names: &[S],
    needed_channels: &[N],
) -> BspResult<Pipeline> {
    PipelineBuilder::new(expr.clone())
        .streams(stream_names)
        .needed_channels(needed_channels)
        .build(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::OperatorConfig;
    use bsp_core::{Marker, SignalBlock, SignalKind};

    fn registry() -> Arc<StreamRegistry> {
        let registry = Arc::new(StreamRegistry::new());
        let info = StreamInfo::new(SignalKind::Eeg, 100.0, &["C3", "Cz", "C4"]).unwrap();
        registry.open("eeg", info, 200, 16).unwrap();
        registry
    }

    fn append(registry: &StreamRegistry, frames: usize, markers: &[Marker]) {
        let data = (0..frames * 3).map(|i| (i % 7) as f32).collect();
        let block = SignalBlock::new(data, 3, 100.0).unwrap();
        registry.get("eeg").unwrap().append(&block, markers).unwrap();
    }

    fn expr() -> FilterExpr {
        FilterExpr::raw(&["C3", "Cz", "C4"], Some(100.0))
            .then(OperatorConfig::new("highpass").with("cutoff", 1.0))
            .then(OperatorConfig::new("moving_average").with("window", 4))
    }

    #[test]
    fn test_pipeline_builder() {
        let registry = registry();
        let pipeline = PipelineBuilder::new(expr())
            .name("Test Pipeline")
            .streams(&["eeg"])
            .build(Arc::clone(&registry))
            .unwrap();

        assert_eq!(pipeline.name(), "Test Pipeline");
        assert_eq!(pipeline.graph().len(), 3);
        assert_eq!(pipeline.output_info().labels(), vec!["C3", "Cz", "C4"]);
        assert!(pipeline.bindings_alive());
    }

    #[test]
    fn test_update_fills_output_ring() {
        let registry = registry();
        let mut pipeline = new_pipeline(Arc::clone(&registry), &expr(), &["eeg"], &[] as &[&str]).unwrap();

        append(&registry, 30, &[Marker::new("cue", 10.0)]);
        let tick = pipeline.update().unwrap();
        assert_eq!(tick.samples.samples(), 30);
        assert_eq!(pipeline.output_smax(), 30);

        append(&registry, 20, &[]);
        pipeline.update().unwrap();
        assert_eq!(pipeline.output_smax(), 50);

        let chunk = pipeline
            .peek_output(45.0, WindowUnit::Samples, &ChannelSubset::All)
            .unwrap();
        assert_eq!(chunk.first_index, 6);
        assert_eq!(chunk.last_index, 50);
        assert_eq!(chunk.events.len(), 1);
        assert_eq!(chunk.events[0].latency, 5.0);
    }

    #[test]
    fn test_peek_output_channel_subset() {
        let registry = registry();
        let mut pipeline = new_pipeline(Arc::clone(&registry), &expr(), &["eeg"], &[] as &[&str]).unwrap();
        append(&registry, 10, &[]);
        pipeline.update().unwrap();

        let chunk = pipeline
            .peek_output(0.05, WindowUnit::Seconds, &ChannelSubset::labels(&["Cz"]))
            .unwrap();
        assert_eq!(chunk.samples(), 5);
        assert_eq!(chunk.labels(), vec!["Cz"]);
    }

    #[test]
    fn test_needed_channels_reduce_output() {
        let registry = registry();
        let expr = FilterExpr::raw(&["C3", "Cz", "C4"], Some(100.0)).then(
            OperatorConfig::new("select_channels").with("channels", vec!["C3".to_string(), "C4".to_string()]),
        );
        let pipeline = new_pipeline(Arc::clone(&registry), &expr, &["eeg"], &["C4"]).unwrap();
        assert_eq!(pipeline.output_info().labels(), vec!["C4"]);
    }

    #[test]
    fn test_performance_summary() {
        let registry = registry();
        let mut pipeline = new_pipeline(Arc::clone(&registry), &expr(), &["eeg"], &[] as &[&str]).unwrap();

        for _ in 0..3 {
            append(&registry, 8, &[]);
            pipeline.update().unwrap();
        }
        pipeline.update().unwrap();

        let performance = pipeline.performance_summary();
        assert_eq!(performance.ticks, 4);
        assert_eq!(performance.idle_ticks, 1);
        assert_eq!(performance.failed_ticks, 0);
        assert_eq!(performance.samples_out, 24);
        assert_eq!(performance.success_rate, 1.0);
        assert_eq!(performance.nodes.len(), 3);
        assert_eq!(performance.nodes[1].operator, "highpass");
        assert_eq!(performance.nodes[1].metrics.invocations, 3);
    }

    #[test]
    fn test_replaced_stream_fails_update() {
        let registry = registry();
        let mut pipeline = new_pipeline(Arc::clone(&registry), &expr(), &["eeg"], &[] as &[&str]).unwrap();

        let info = StreamInfo::new(SignalKind::Eeg, 100.0, &["C3", "Cz", "C4"]).unwrap();
        registry.open("eeg", info, 200, 16).unwrap();
        assert!(!pipeline.bindings_alive());
        assert!(matches!(pipeline.update(), Err(BspError::StaleBinding { .. })));
        assert_eq!(pipeline.performance_summary().failed_ticks, 1);
    }

    #[test]
    fn test_invalid_builder_arguments() {
        let registry = registry();
        let config = PipelineConfig {
            output_capacity: 0,
            ..Default::default()
        };
        assert!(PipelineBuilder::new(expr()).config(config).build(Arc::clone(&registry)).is_err());
        assert!(matches!(
            PipelineBuilder::new(expr()).name("").build(registry),
            Err(BspError::InvalidArgument { argument: "name", .. })
        ));
    }
}
