//! BSP-Processing: online filter pipelines over live biosignal streams
//!
//! Calibrated filter expressions are bound to named streams, turned into an
//! arena graph of pure and stateful operators, and evaluated incrementally on
//! every tick.

pub mod catalog;
pub mod channels;
pub mod config;
pub mod evaluator;
pub mod expr;
pub mod features;
pub mod filters;
pub mod graph;
pub mod pipeline;
pub mod processor;

pub use catalog::{OperatorCatalog, OperatorFactory, OperatorInstance, SELECT_CHANNELS};
pub use channels::{Merge, Rereference, Scale, SelectChannels};
pub use config::{LagPolicy, PipelineConfig};
pub use evaluator::{evaluate, TickOutput};
pub use expr::FilterExpr;
pub use features::{BandPower, FrequencyBand};
pub use filters::{BiquadFilter, FilterType, MovingAverageFilter};
pub use graph::{LeafBinding, Node, NodeId, NodeKind, NodeMetrics, PipelineGraph};
pub use pipeline::{
    new_pipeline, NodePerformance, Pipeline, PipelineBuilder, PipelineId, PipelinePerformance,
};
pub use processor::{
    OperatorConfig, OperatorState, ParameterValue, ProcessingMetrics, ProcessingTimer,
    PureOperator, StatefulOperator,
};
