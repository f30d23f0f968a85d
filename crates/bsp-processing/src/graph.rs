//! PipelineGraph: an arena of filter nodes built from a calibrated expression
//!
//! Nodes are stored in a `Vec` and refer to their inputs by [`NodeId`], so the
//! graph has no pointer cycles and evaluation order is just a list of ids.
//! Raw-data leaves are bound by name to live streams at construction time.

use crate::catalog::{OperatorCatalog, OperatorInstance, SELECT_CHANNELS};
use crate::expr::FilterExpr;
use crate::processor::{
    OperatorConfig, OperatorState, ParameterValue, ProcessingMetrics, PureOperator, StatefulOperator,
};
use bsp_core::{BspError, BspResult, StreamHandle, StreamId, StreamInfo, StreamRegistry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Index of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Binding of a raw-data leaf to a live stream
#[derive(Debug, Clone, PartialEq)]
pub struct LeafBinding {
    /// Registry name of the bound stream
    pub stream_name: String,
    /// Identity of the stream at binding time
    pub stream_id: StreamId,
    /// Stream channel indices delivered by this leaf, in output order
    pub channel_indices: Vec<usize>,
    /// Last stream sample this leaf has consumed
    pub smax_seen: u64,
}

/// What a node does
pub enum NodeKind {
    /// Reads new samples from a stream
    Leaf(LeafBinding),
    /// Pure transform
    Stateless(Box<dyn PureOperator>),
    /// Transform with carried state
    Stateful {
        operator: Box<dyn StatefulOperator>,
        state: OperatorState,
    },
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf(_))
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, NodeKind::Stateful { .. })
    }
}

/// Accumulated timing of one node
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMetrics {
    pub invocations: u64,
    pub failures: u64,
    pub slow_invocations: u64,
    pub total_time_us: u64,
    pub max_time_us: u64,
    pub samples_out: u64,
    pub last: Option<ProcessingMetrics>,
}

impl NodeMetrics {
    pub(crate) fn record(&mut self, metrics: ProcessingMetrics, slow_threshold_us: u64) {
        self.invocations += 1;
        if !metrics.success {
            self.failures += 1;
        }
        if metrics.processing_time_us > slow_threshold_us {
            self.slow_invocations += 1;
        }
        self.total_time_us += metrics.processing_time_us;
        self.max_time_us = self.max_time_us.max(metrics.processing_time_us);
        self.samples_out += metrics.samples_out as u64;
        self.last = Some(metrics);
    }

    pub fn avg_time_us(&self) -> u64 {
        if self.invocations == 0 {
            0
        } else {
            self.total_time_us / self.invocations
        }
    }
}

/// One node of the graph
pub struct Node {
    /// Human-readable label used in logs and errors
    pub label: String,
    pub kind: NodeKind,
    /// Input nodes, in operator argument order
    pub inputs: Vec<NodeId>,
    /// Channel layout and sampling rate of this node's output
    pub layout: StreamInfo,
    pub metrics: NodeMetrics,
}

impl Node {
    /// Operator name, or `raw_data` for leaves
    pub fn operator_name(&self) -> &str {
        match &self.kind {
            NodeKind::Leaf(_) => "raw_data",
            NodeKind::Stateless(op) => op.name(),
            NodeKind::Stateful { operator, .. } => operator.name(),
        }
    }

    /// Whether output samples line up one-to-one with the input samples
    pub fn preserves_samples(&self) -> bool {
        match &self.kind {
            NodeKind::Leaf(_) => true,
            NodeKind::Stateless(op) => op.preserves_samples(),
            NodeKind::Stateful { operator, .. } => operator.preserves_samples(),
        }
    }
}

/// Directed acyclic graph of filter nodes
pub struct PipelineGraph {
    pub(crate) nodes: Vec<Node>,
    order: Vec<NodeId>,
    root: NodeId,
    leaves: Vec<NodeId>,
}

impl PipelineGraph {
    /// Build a graph from a filter expression, binding its leaves to streams.
    ///
    /// `stream_names` lists the candidate streams (every registered stream
    /// when empty). `needed_channels`, when non-empty, lets leaves bind to
    /// streams that only carry the channels the output actually needs.
    pub fn build<S: AsRef<str>, N: AsRef<str>>(
        expr: &FilterExpr,
        registry: &StreamRegistry,
        stream_names: &[S],
        needed_channels: &[N],
        catalog: &OperatorCatalog,
    ) -> BspResult<Self> {
        expr.validate()?;

        let names: Vec<String> = if stream_names.is_empty() {
            registry.names()
        } else {
            stream_names.iter().map(|s| s.as_ref().to_string()).collect()
        };
        let candidates = names
            .iter()
            .map(|name| registry.get(name))
            .collect::<BspResult<Vec<_>>>()?;

        let needed: Option<Vec<String>> = if needed_channels.is_empty() {
            None
        } else {
            Some(needed_channels.iter().map(|s| s.as_ref().to_string()).collect())
        };

        let mut builder = GraphBuilder {
            catalog,
            candidates,
            needed: needed.as_deref(),
            nodes: Vec::new(),
            memo: HashMap::new(),
        };
        let root = builder.add(expr)?;
        let nodes = builder.nodes;

        if let Some(needed) = &needed {
            let layout = &nodes[root.0].layout;
            let present = needed.iter().filter(|l| layout.channel_index(l).is_some()).count();
            if present != needed.len() {
                return Err(BspError::shape(
                    format!(
                        "needed channels [{}] in pipeline output [{}]",
                        needed.join(", "),
                        layout.labels().join(", ")
                    ),
                    needed.len(),
                    present,
                ));
            }
        }

        let order = post_order(&nodes, root);
        let leaves = order
            .iter()
            .copied()
            .filter(|id| nodes[id.0].kind.is_leaf())
            .collect();

        let graph = PipelineGraph {
            nodes,
            order,
            root,
            leaves,
        };
        info!(
            nodes = graph.len(),
            leaves = graph.leaves.len(),
            streams = ?graph.bound_streams().iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            "Pipeline graph built"
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Evaluation order (inputs before consumers, root last)
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// True when the root keeps the primary leaf's sample grid: every node on
    /// the path from the root down its first inputs preserves samples
    pub fn keeps_primary_grid(&self) -> bool {
        let mut id = self.root;
        loop {
            let node = &self.nodes[id.0];
            if !node.preserves_samples() {
                return false;
            }
            match node.inputs.first() {
                Some(&input) => id = input,
                None => return self.leaves.first() == Some(&id),
            }
        }
    }

    /// Output layout of the root
    pub fn output_layout(&self) -> &StreamInfo {
        &self.nodes[self.root.0].layout
    }

    /// Leaf binding of a node, if it is a leaf
    pub fn leaf(&self, id: NodeId) -> Option<&LeafBinding> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(binding) => Some(binding),
            _ => None,
        }
    }

    /// Distinct streams bound by the leaves, in leaf order
    pub fn bound_streams(&self) -> Vec<(String, StreamId)> {
        let mut seen = HashSet::new();
        self.leaves
            .iter()
            .filter_map(|&id| self.leaf(id))
            .filter(|b| seen.insert(b.stream_id))
            .map(|b| (b.stream_name.clone(), b.stream_id))
            .collect()
    }

    /// Serialized state of every stateful node, keyed by node label
    pub fn state_snapshot(&self) -> Vec<(String, serde_json::Value)> {
        self.nodes
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Stateful { state, .. } => Some((node.label.clone(), state.snapshot())),
                _ => None,
            })
            .collect()
    }

    /// Read cursor of every leaf, in leaf order
    pub fn leaf_cursors(&self) -> Vec<u64> {
        self.leaves
            .iter()
            .filter_map(|&id| self.leaf(id))
            .map(|b| b.smax_seen)
            .collect()
    }
}

fn post_order(nodes: &[Node], root: NodeId) -> Vec<NodeId> {
    fn visit(nodes: &[Node], id: NodeId, seen: &mut HashSet<NodeId>, order: &mut Vec<NodeId>) {
        if !seen.insert(id) {
            return;
        }
        for &input in &nodes[id.0].inputs {
            visit(nodes, input, seen, order);
        }
        order.push(id);
    }

    let mut order = Vec::with_capacity(nodes.len());
    visit(nodes, root, &mut HashSet::new(), &mut order);
    order
}

struct GraphBuilder<'a> {
    catalog: &'a OperatorCatalog,
    candidates: Vec<Arc<StreamHandle>>,
    needed: Option<&'a [String]>,
    nodes: Vec<Node>,
    memo: HashMap<String, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    fn add(&mut self, expr: &FilterExpr) -> BspResult<NodeId> {
        let key = expr.key()?;
        if let Some(&id) = self.memo.get(&key) {
            return Ok(id);
        }

        let id = match expr {
            FilterExpr::RawData { channels, srate } => self.add_leaf(channels, *srate)?,
            FilterExpr::Apply { operator, inputs } => {
                let input_ids = inputs
                    .iter()
                    .map(|input| self.add(input))
                    .collect::<BspResult<Vec<_>>>()?;
                self.add_operator(operator, input_ids)?
            }
        };

        self.memo.insert(key, id);
        Ok(id)
    }

    fn push(&mut self, label: String, kind: NodeKind, inputs: Vec<NodeId>, layout: StreamInfo) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug!(node = %label, channels = layout.channel_count(), srate = layout.sampling_rate, "Node added");
        self.nodes.push(Node {
            label,
            kind,
            inputs,
            layout,
            metrics: NodeMetrics::default(),
        });
        id
    }

    fn add_leaf(&mut self, channels: &[String], srate: Option<f32>) -> BspResult<NodeId> {
        let required: Vec<String> = match self.needed {
            Some(needed) => channels.iter().filter(|c| needed.contains(c)).cloned().collect(),
            None => channels.to_vec(),
        };
        if required.is_empty() {
            return Err(BspError::shape(
                format!("needed channels among raw data leaf [{}]", channels.join(", ")),
                self.needed.map(<[String]>::len).unwrap_or(0),
                0,
            ));
        }

        let description = format!(
            "channels [{}]{}",
            channels.join(", "),
            srate.map(|s| format!(" at {} Hz", s)).unwrap_or_default()
        );

        // Rank 1: carries every calibrated channel; rank 0: only the needed subset
        let ranked: Vec<(u8, &Arc<StreamHandle>)> = self
            .candidates
            .iter()
            .filter(|s| srate.map_or(true, |r| (s.sampling_rate() - r).abs() < 1e-3))
            .filter(|s| s.info().contains_all(required.as_slice()))
            .map(|s| (u8::from(s.info().contains_all(channels)), s))
            .collect();

        let best = ranked.iter().map(|(rank, _)| *rank).max().ok_or_else(|| {
            BspError::NotFound {
                kind: "stream",
                name: description.clone(),
                hint: Some(format!(
                    "none of the candidate streams [{}] carries channels [{}]",
                    self.candidates.iter().map(|s| s.name()).collect::<Vec<_>>().join(", "),
                    required.join(", ")
                )),
            }
        })?;

        let top: Vec<&Arc<StreamHandle>> = ranked
            .iter()
            .filter(|(rank, _)| *rank == best)
            .map(|(_, s)| *s)
            .collect();
        if top.len() > 1 {
            return Err(BspError::AmbiguousBinding {
                leaf: description,
                candidates: top.iter().map(|s| s.name().to_string()).collect(),
            });
        }
        let stream = Arc::clone(top[0]);

        let labels = if best == 1 { channels } else { required.as_slice() };
        let channel_indices: Vec<usize> = labels
            .iter()
            .filter_map(|l| stream.info().channel_index(l))
            .collect();
        let layout = stream.info().select(&channel_indices);

        info!(
            stream = stream.name(),
            id = %stream.id(),
            channels = channel_indices.len(),
            "Raw data leaf bound"
        );

        let binding = LeafBinding {
            stream_name: stream.name().to_string(),
            stream_id: stream.id(),
            channel_indices,
            smax_seen: stream.smax(),
        };
        let label = format!("raw_data#{}[{}]", self.nodes.len(), stream.name());
        Ok(self.push(label, NodeKind::Leaf(binding), Vec::new(), layout))
    }

    fn add_operator(&mut self, config: &OperatorConfig, inputs: Vec<NodeId>) -> BspResult<NodeId> {
        let layouts: Vec<StreamInfo> = inputs.iter().map(|id| self.nodes[id.0].layout.clone()).collect();

        let mut config = config.clone();
        if config.name == SELECT_CHANNELS && layouts.len() == 1 {
            let mut labels = config.require_strings("channels")?;
            if self.needed.is_some() {
                labels.retain(|l| layouts[0].channel_index(l).is_some());
                if labels.is_empty() {
                    return Err(BspError::shape(
                        format!("channel selection over [{}]", layouts[0].labels().join(", ")),
                        1,
                        0,
                    ));
                }
            }
            if labels == layouts[0].labels() {
                debug!(input = %inputs[0], "Identity channel selection pruned");
                return Ok(inputs[0]);
            }
            config.set_parameter("channels", ParameterValue::StringArray(labels));
        }

        let instance = self.catalog.instantiate(&config, &layouts)?;
        let layout = instance.output_layout(&layouts)?;
        let label = format!("{}#{}", instance.name(), self.nodes.len());

        let kind = match instance {
            OperatorInstance::Pure(operator) => NodeKind::Stateless(operator),
            OperatorInstance::Stateful(operator) => {
                let state = operator.init_state(&layouts)?;
                NodeKind::Stateful { operator, state }
            }
        };
        Ok(self.push(label, kind, inputs, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsp_core::SignalKind;

    fn registry(streams: &[(&str, &[&str])]) -> StreamRegistry {
        let registry = StreamRegistry::new();
        for (name, labels) in streams {
            let info = StreamInfo::new(SignalKind::Eeg, 100.0, labels).unwrap();
            registry.open(name, info, 1000, 16).unwrap();
        }
        registry
    }

    fn highpass() -> OperatorConfig {
        OperatorConfig::new("highpass").with("cutoff", 1.0)
    }

    fn select(labels: &[&str]) -> OperatorConfig {
        OperatorConfig::new(SELECT_CHANNELS).with("channels", labels)
    }

    const NONE: &[&str] = &[];

    #[test]
    fn test_chain_builds_in_post_order() {
        let registry = registry(&[("eeg", &["C3", "Cz", "C4"])]);
        let expr = FilterExpr::raw(&["C3", "C4"], Some(100.0))
            .then(highpass())
            .then(OperatorConfig::new("scale").with("factor", 2.0));

        let graph = PipelineGraph::build(&expr, &registry, &["eeg"], NONE, &OperatorCatalog::default()).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.order(), &[NodeId(0), NodeId(1), NodeId(2)]);
        assert_eq!(graph.root(), NodeId(2));
        assert!(graph.node(NodeId(1)).kind.is_stateful());
        assert!(!graph.node(NodeId(2)).kind.is_stateful());
        assert_eq!(graph.output_layout().labels(), vec!["C3", "C4"]);
        assert_eq!(graph.leaf(NodeId(0)).unwrap().channel_indices, vec![0, 2]);
        assert_eq!(graph.bound_streams()[0].0, "eeg");
    }

    #[test]
    fn test_identical_subexpressions_share_a_node() {
        let registry = registry(&[("eeg", &["C3", "C4"])]);
        let branch = FilterExpr::raw(&["C3", "C4"], None).then(highpass());
        let expr = FilterExpr::apply(
            OperatorConfig::new("merge"),
            vec![
                branch.clone().then(select(&["C3"])),
                branch.then(select(&["C4"])),
            ],
        );

        let graph = PipelineGraph::build(&expr, &registry, NONE, NONE, &OperatorCatalog::default()).unwrap();
        // raw, highpass, two selections, merge
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.leaves().len(), 1);
        assert_eq!(graph.output_layout().labels(), vec!["C3", "C4"]);
    }

    #[test]
    fn test_ambiguous_binding() {
        let registry = registry(&[("left", &["C3", "C4"]), ("right", &["C4", "C3", "Pz"])]);
        let expr = FilterExpr::raw(&["C3", "C4"], None).then(highpass());

        let err = PipelineGraph::build(&expr, &registry, &["left", "right"], NONE, &OperatorCatalog::default())
            .err()
            .unwrap();
        match err {
            BspError::AmbiguousBinding { candidates, .. } => {
                assert_eq!(candidates, vec!["left".to_string(), "right".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }

        // Naming a single candidate resolves it
        assert!(PipelineGraph::build(&expr, &registry, &["right"], NONE, &OperatorCatalog::default()).is_ok());
    }

    #[test]
    fn test_no_matching_stream() {
        let registry = registry(&[("eeg", &["C3"])]);
        let expr = FilterExpr::raw(&["C3", "C4"], None);
        let err = PipelineGraph::build(&expr, &registry, NONE, NONE, &OperatorCatalog::default())
            .err()
            .unwrap();
        assert!(matches!(err, BspError::NotFound { kind: "stream", .. }));

        let missing = PipelineGraph::build(&expr, &registry, &["emg"], NONE, &OperatorCatalog::default())
            .err()
            .unwrap();
        assert!(matches!(missing, BspError::NotFound { .. }));
    }

    #[test]
    fn test_sampling_rate_must_match() {
        let registry = registry(&[("eeg", &["C3"])]);
        let expr = FilterExpr::raw(&["C3"], Some(250.0));
        assert!(PipelineGraph::build(&expr, &registry, NONE, NONE, &OperatorCatalog::default()).is_err());
    }

    #[test]
    fn test_needed_channels_allow_reduced_stream() {
        let registry = registry(&[("cap", &["C3", "C4"])]);
        let expr = FilterExpr::raw(&["C3", "Cz", "C4"], None)
            .then(highpass())
            .then(select(&["C3", "Cz"]));

        // Without a restriction the leaf cannot bind
        assert!(PipelineGraph::build(&expr, &registry, NONE, NONE, &OperatorCatalog::default()).is_err());

        let graph = PipelineGraph::build(&expr, &registry, NONE, &["C3"], &OperatorCatalog::default()).unwrap();
        assert_eq!(graph.output_layout().labels(), vec!["C3"]);
        assert_eq!(graph.leaf(graph.leaves()[0]).unwrap().channel_indices, vec![0]);
    }

    #[test]
    fn test_needed_channels_prune_identity_selection() {
        let registry = registry(&[("cap", &["C3", "C4", "Pz"])]);
        let expr = FilterExpr::raw(&["C3", "Cz", "C4"], None)
            .then(select(&["C3", "C4"]))
            .then(highpass());

        let graph = PipelineGraph::build(&expr, &registry, NONE, &["C3", "C4"], &OperatorCatalog::default()).unwrap();
        // Leaf delivers exactly C3, C4 so the selection disappears
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.node(graph.root()).operator_name(), "highpass");
    }

    #[test]
    fn test_needed_channels_prefer_full_calibrated_set() {
        let registry = registry(&[("full", &["C3", "Cz", "C4"]), ("reduced", &["C3", "C4"])]);
        let expr = FilterExpr::raw(&["C3", "Cz", "C4"], None)
            .then(OperatorConfig::new("rereference"))
            .then(select(&["C3"]));

        let graph = PipelineGraph::build(&expr, &registry, NONE, &["C3"], &OperatorCatalog::default()).unwrap();
        assert_eq!(graph.bound_streams()[0].0, "full");
        assert_eq!(graph.leaf(graph.leaves()[0]).unwrap().channel_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_missing_needed_output_channel() {
        let registry = registry(&[("eeg", &["C3", "C4"])]);
        let expr = FilterExpr::raw(&["C3", "C4"], None).then(select(&["C3"]));

        let err = PipelineGraph::build(&expr, &registry, NONE, &["C4"], &OperatorCatalog::default())
            .err()
            .unwrap();
        assert!(matches!(err, BspError::Shape { .. }));
    }

    #[test]
    fn test_leaf_cursor_starts_at_stream_head() {
        let registry = registry(&[("eeg", &["C3"])]);
        let stream = registry.get("eeg").unwrap();
        stream
            .append(&bsp_core::SignalBlock::new(vec![0.0; 40], 1, 100.0).unwrap(), &[])
            .unwrap();

        let graph = PipelineGraph::build(&FilterExpr::raw(&["C3"], None), &registry, NONE, NONE, &OperatorCatalog::default()).unwrap();
        assert_eq!(graph.leaf_cursors(), vec![40]);
        assert!(graph.state_snapshot().is_empty());
    }
}
