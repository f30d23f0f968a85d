//! IncrementalEvaluator: one tick of a pipeline graph
//!
//! Each tick reads only the samples that arrived since the previous tick,
//! pushes them through the graph in post-order and returns the root's new
//! output. Operator state is staged per tick and committed only when every
//! node succeeded, so a failed tick leaves the graph exactly as it was.

use crate::config::{LagPolicy, PipelineConfig};
use crate::graph::{NodeId, NodeKind, PipelineGraph};
use crate::processor::{OperatorState, ProcessingMetrics};
use bsp_core::{BspError, BspResult, Marker, SignalBlock, StreamRegistry};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one evaluation tick
#[derive(Debug, Clone)]
pub struct TickOutput {
    /// New root samples produced this tick
    pub samples: SignalBlock,
    /// Markers attached to the new samples, latencies relative to `samples` (1-based)
    pub markers: Vec<Marker>,
    /// Markers that arrived on the primary leaf, relative to its new samples
    pub input_markers: Vec<Marker>,
    /// New samples read by the primary (first) leaf
    pub leaf_samples: usize,
    /// Samples skipped because a leaf fell behind its stream's ring
    pub dropped_samples: u64,
    /// Wall time of the tick in microseconds
    pub elapsed_us: u64,
}

impl TickOutput {
    /// True when no new output was produced
    pub fn is_idle(&self) -> bool {
        self.samples.is_empty()
    }
}

struct LeafRead {
    block: SignalBlock,
    markers: Vec<Marker>,
    new_cursor: u64,
    dropped: u64,
}

fn read_leaf(
    graph: &PipelineGraph,
    id: NodeId,
    registry: &StreamRegistry,
    config: &PipelineConfig,
) -> BspResult<LeafRead> {
    let node = graph.node(id);
    let leaf = graph
        .leaf(id)
        .ok_or_else(|| BspError::processing(format!("node '{}' is not a leaf", node.label)))?;

    let stream = registry.get_bound(&leaf.stream_name, leaf.stream_id)?;
    let ring = stream.read();
    let smax = ring.smax();
    let oldest = ring.oldest_retained();

    let mut start = leaf.smax_seen + 1;
    let mut dropped = 0;
    if start < oldest {
        match config.lag_policy {
            LagPolicy::Fail => {
                return Err(BspError::Range {
                    start,
                    oldest,
                    capacity: ring.capacity(),
                });
            }
            LagPolicy::ResumeAtOldest => {
                dropped = oldest - start;
                warn!(
                    node = %node.label,
                    stream = %leaf.stream_name,
                    dropped,
                    "Leaf fell behind the stream buffer; resuming at the oldest retained sample"
                );
                start = oldest;
            }
        }
    }

    if start > smax {
        return Ok(LeafRead {
            block: SignalBlock::empty(node.layout.channel_count(), node.layout.sampling_rate),
            markers: Vec::new(),
            new_cursor: leaf.smax_seen.max(smax),
            dropped,
        });
    }

    let block = ring.read_window(start, smax)?.select_channels(&leaf.channel_indices)?;
    let offset = start as f64 - 1.0;
    let markers = ring
        .markers_in(start, smax)
        .into_iter()
        .map(|m| m.shifted(-offset))
        .collect();

    Ok(LeafRead {
        block,
        markers,
        new_cursor: smax,
        dropped,
    })
}

fn run_guarded<F>(operator: &str, f: F) -> BspResult<SignalBlock>
where
    F: FnOnce() -> BspResult<SignalBlock>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_panic) => Err(BspError::processing(format!("operator '{}' panicked", operator))),
    }
}

/// Work of a tick that has not been committed yet
struct StagedTick {
    outputs: Vec<Option<SignalBlock>>,
    states: Vec<(NodeId, OperatorState)>,
    cursors: Vec<(NodeId, u64)>,
    leaf_markers: Vec<Marker>,
    leaf_samples: usize,
    dropped_samples: u64,
}

fn run_nodes(
    graph: &PipelineGraph,
    registry: &StreamRegistry,
    config: &PipelineConfig,
    timings: &mut Vec<(NodeId, ProcessingMetrics)>,
) -> BspResult<StagedTick> {
    let primary_leaf = graph.leaves().first().copied();
    let mut staged = StagedTick {
        outputs: vec![None; graph.len()],
        states: Vec::new(),
        cursors: Vec::new(),
        leaf_markers: Vec::new(),
        leaf_samples: 0,
        dropped_samples: 0,
    };

    for &id in graph.order() {
        let node = graph.node(id);

        let output = match &node.kind {
            NodeKind::Leaf(_) => {
                let read = read_leaf(graph, id, registry, config)?;
                if Some(id) == primary_leaf {
                    staged.leaf_samples = read.block.samples();
                    staged.leaf_markers = read.markers;
                }
                staged.dropped_samples += read.dropped;
                staged.cursors.push((id, read.new_cursor));
                read.block
            }
            kind => {
                let inputs: Vec<SignalBlock> = node
                    .inputs
                    .iter()
                    .map(|input| {
                        staged.outputs[input.0].clone().unwrap_or_else(|| {
                            let layout = &graph.node(*input).layout;
                            SignalBlock::empty(layout.channel_count(), layout.sampling_rate)
                        })
                    })
                    .collect();

                if inputs.iter().all(SignalBlock::is_empty) {
                    // Nothing new reaches this node; its state stays untouched
                    SignalBlock::empty(node.layout.channel_count(), node.layout.sampling_rate)
                } else {
                    let mut timer = ProcessingMetrics::start_timing();
                    timer.set_samples_in(inputs.iter().map(SignalBlock::samples).sum());

                    let result = match kind {
                        NodeKind::Stateful { operator, state } => {
                            let mut next = state.clone();
                            let result =
                                run_guarded(operator.name(), || operator.apply(&mut next, &inputs));
                            if result.is_ok() {
                                staged.states.push((id, next));
                            }
                            result
                        }
                        NodeKind::Stateless(operator) => {
                            run_guarded(operator.name(), || operator.apply(&inputs))
                        }
                        NodeKind::Leaf(_) => Err(BspError::processing("leaf evaluated as operator")),
                    };

                    match result {
                        Ok(block) => {
                            timings.push((id, timer.finish(block.samples())));
                            block
                        }
                        Err(cause) => {
                            timings.push((id, timer.finish_with_error(&cause.to_string())));
                            return Err(BspError::OperatorFailure {
                                node: node.label.clone(),
                                operator: node.operator_name().to_string(),
                                cause: Box::new(cause),
                            });
                        }
                    }
                }
            }
        };

        staged.outputs[id.0] = Some(output);
    }

    Ok(staged)
}

/// Evaluate one tick of `graph` against the streams in `registry`
pub fn evaluate(
    graph: &mut PipelineGraph,
    registry: &StreamRegistry,
    config: &PipelineConfig,
) -> BspResult<TickOutput> {
    let tick_start = Instant::now();
    let mut timings = Vec::new();
    let outcome = run_nodes(graph, registry, config, &mut timings);

    // Timing is diagnostic and recorded even for failed ticks
    for (id, metrics) in timings {
        let node = &mut graph.nodes[id.0];
        if metrics.processing_time_us > config.slow_node_threshold_us {
            warn!(
                node = %node.label,
                elapsed_us = metrics.processing_time_us,
                threshold_us = config.slow_node_threshold_us,
                "Slow pipeline node"
            );
        }
        node.metrics.record(metrics, config.slow_node_threshold_us);
    }

    let mut staged = outcome?;

    // Commit
    for (id, next) in staged.states {
        if let NodeKind::Stateful { state, .. } = &mut graph.nodes[id.0].kind {
            *state = next;
        }
    }
    for (id, cursor) in staged.cursors {
        if let NodeKind::Leaf(binding) = &mut graph.nodes[id.0].kind {
            binding.smax_seen = cursor;
        }
    }

    let samples = staged.outputs[graph.root().0].take().unwrap_or_else(|| {
        let layout = graph.output_layout();
        SignalBlock::empty(layout.channel_count(), layout.sampling_rate)
    });

    // Markers survive only when the root keeps the primary leaf's sample grid
    let markers = if graph.keeps_primary_grid()
        && !samples.is_empty()
        && samples.samples() == staged.leaf_samples
    {
        staged.leaf_markers.clone()
    } else {
        Vec::new()
    };

    let elapsed_us = tick_start.elapsed().as_micros() as u64;
    debug!(
        leaf_samples = staged.leaf_samples,
        output_samples = samples.samples(),
        markers = markers.len(),
        elapsed_us,
        "Pipeline tick evaluated"
    );

    Ok(TickOutput {
        samples,
        markers,
        input_markers: staged.leaf_markers,
        leaf_samples: staged.leaf_samples,
        dropped_samples: staged.dropped_samples,
        elapsed_us,
    })
}
