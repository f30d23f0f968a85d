//! Operator catalog: name → factory producing a pure or stateful operator
//!
//! Statefulness is decided here, once, when a pipeline is built.

use crate::channels::{Merge, Rereference, Scale, SelectChannels};
use crate::features::BandPower;
use crate::filters::{BiquadFilter, MovingAverageFilter};
use crate::processor::{OperatorConfig, OperatorState, PureOperator, StatefulOperator};
use bsp_core::{BspError, BspResult, SignalBlock, StreamInfo};
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog name of the channel selection operator
pub const SELECT_CHANNELS: &str = "select_channels";

/// An instantiated operator
pub enum OperatorInstance {
    Pure(Box<dyn PureOperator>),
    Stateful(Box<dyn StatefulOperator>),
}

impl OperatorInstance {
    pub fn is_stateful(&self) -> bool {
        matches!(self, OperatorInstance::Stateful(_))
    }

    pub fn name(&self) -> &str {
        match self {
            OperatorInstance::Pure(op) => op.name(),
            OperatorInstance::Stateful(op) => op.name(),
        }
    }

    pub fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        match self {
            OperatorInstance::Pure(op) => op.output_layout(inputs),
            OperatorInstance::Stateful(op) => op.output_layout(inputs),
        }
    }
}

/// Factory building an operator from its configuration and input layouts
pub type OperatorFactory =
    Arc<dyn Fn(&OperatorConfig, &[StreamInfo]) -> BspResult<OperatorInstance> + Send + Sync>;

/// Runs a pure operator as a stateful node with an empty state
struct PureAsStateful(Box<dyn PureOperator>);

impl StatefulOperator for PureAsStateful {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn preserves_samples(&self) -> bool {
        self.0.preserves_samples()
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        self.0.output_layout(inputs)
    }

    fn init_state(&self, _inputs: &[StreamInfo]) -> BspResult<OperatorState> {
        Ok(OperatorState::new(()))
    }

    fn apply(&self, _state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        self.0.apply(inputs)
    }
}

/// Registry of operator factories by name
#[derive(Clone)]
pub struct OperatorCatalog {
    factories: HashMap<String, OperatorFactory>,
}

fn single_input<'a>(config: &OperatorConfig, inputs: &'a [StreamInfo]) -> BspResult<&'a StreamInfo> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BspError::shape(
            format!("inputs of operator '{}'", config.name),
            1,
            inputs.len(),
        )),
    }
}

impl OperatorCatalog {
    /// Catalog without any operators
    pub fn empty() -> Self {
        OperatorCatalog {
            factories: HashMap::new(),
        }
    }

    /// Catalog with the built-in operators
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();

        catalog.register("highpass", |config, _| {
            Ok(OperatorInstance::Stateful(Box::new(BiquadFilter::highpass_from_config(config)?)))
        });
        catalog.register("lowpass", |config, _| {
            Ok(OperatorInstance::Stateful(Box::new(BiquadFilter::lowpass_from_config(config)?)))
        });
        catalog.register("notch", |config, _| {
            Ok(OperatorInstance::Stateful(Box::new(BiquadFilter::notch_from_config(config)?)))
        });
        catalog.register("moving_average", |config, _| {
            Ok(OperatorInstance::Stateful(Box::new(MovingAverageFilter::from_config(config)?)))
        });
        catalog.register("band_power", |config, _| {
            Ok(OperatorInstance::Stateful(Box::new(BandPower::from_config(config)?)))
        });
        catalog.register("merge", |config, inputs| {
            let mut merge = Merge::new(&config.name, inputs)?;
            if config.get_parameter("max_backlog").is_some() {
                merge = merge.with_max_backlog(config.require_usize("max_backlog")?)?;
            }
            Ok(OperatorInstance::Stateful(Box::new(merge)))
        });
        catalog.register(SELECT_CHANNELS, |config, inputs| {
            let input = single_input(config, inputs)?;
            let labels = config.require_strings("channels")?;
            Ok(OperatorInstance::Pure(Box::new(SelectChannels::new(&config.name, &labels, input)?)))
        });
        catalog.register("rereference", |config, inputs| {
            let input = single_input(config, inputs)?;
            let reference = match config.get_parameter("reference") {
                Some(_) => Some(config.require_strings("reference")?),
                None => None,
            };
            Ok(OperatorInstance::Pure(Box::new(Rereference::new(
                &config.name,
                reference.as_deref(),
                input,
            )?)))
        });
        catalog.register("scale", |config, _| {
            let factor = config.get_float("factor", 1.0) as f32;
            let offset = config.get_float("offset", 0.0) as f32;
            Ok(OperatorInstance::Pure(Box::new(Scale::new(&config.name, factor, offset)?)))
        });

        catalog
    }

    /// Register (or replace) an operator factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&OperatorConfig, &[StreamInfo]) -> BspResult<OperatorInstance> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered operator names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate an operator for the given input layouts
    pub fn instantiate(
        &self,
        config: &OperatorConfig,
        inputs: &[StreamInfo],
    ) -> BspResult<OperatorInstance> {
        config.validate()?;
        let factory = self.factories.get(&config.name).ok_or_else(|| BspError::NotFound {
            kind: "operator",
            name: config.name.clone(),
            hint: Some(format!("known operators: {}", self.names().join(", "))),
        })?;

        let instance = factory(config, inputs)?;
        match (config.stateful, instance) {
            (Some(true), OperatorInstance::Pure(op)) => {
                Ok(OperatorInstance::Stateful(Box::new(PureAsStateful(op))))
            }
            (Some(false), OperatorInstance::Stateful(_)) => Err(BspError::configuration(format!(
                "operator '{}' carries state and cannot be marked stateless",
                config.name
            ))),
            (_, instance) => Ok(instance),
        }
    }
}

impl Default for OperatorCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}
