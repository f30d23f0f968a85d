//! Core operator traits and types
//!
//! Every pipeline node wraps either a [`PureOperator`] (output depends only on
//! the current input) or a [`StatefulOperator`] (output depends on carried
//! state). State lives outside the operator in an [`OperatorState`] so the
//! evaluator can stage it and commit only on success.

use bsp_core::{BspError, BspResult, SignalBlock, StreamInfo};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Operator whose output depends only on the inputs of the current call
pub trait PureOperator: Send + Sync {
    /// Operator name as registered in the catalog
    fn name(&self) -> &str;

    /// Output channel layout and sampling rate for the given input layouts
    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo>;

    /// Transform one batch of new samples
    fn apply(&self, inputs: &[SignalBlock]) -> BspResult<SignalBlock>;

    /// True when every output sample lines up with the input sample at the
    /// same position, so markers can be carried through unchanged
    fn preserves_samples(&self) -> bool {
        false
    }
}

/// Operator that threads state from one call to the next
pub trait StatefulOperator: Send + Sync {
    /// Operator name as registered in the catalog
    fn name(&self) -> &str;

    /// Output channel layout and sampling rate for the given input layouts
    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo>;

    /// Initial state for the given input layouts
    fn init_state(&self, inputs: &[StreamInfo]) -> BspResult<OperatorState>;

    /// Transform one batch of new samples, updating `state` in place
    fn apply(&self, state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock>;

    /// True when every output sample lines up with the input sample at the
    /// same position, so markers can be carried through unchanged
    fn preserves_samples(&self) -> bool {
        false
    }
}

trait ErasedState: Send + Sync {
    fn clone_box(&self) -> Box<dyn ErasedState>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn snapshot(&self) -> serde_json::Value;
    fn type_name(&self) -> &'static str;
}

impl<S> ErasedState for S
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    fn clone_box(&self) -> Box<dyn ErasedState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<S>()
    }
}

/// Opaque carried state of a stateful operator
pub struct OperatorState(Box<dyn ErasedState>);

impl OperatorState {
    pub fn new<S>(state: S) -> Self
    where
        S: Clone + Serialize + Send + Sync + 'static,
    {
        OperatorState(Box::new(state))
    }

    /// Borrow the concrete state
    pub fn downcast_ref<S: 'static>(&self) -> BspResult<&S> {
        let found = self.0.type_name();
        self.0.as_any().downcast_ref::<S>().ok_or_else(|| {
            BspError::processing(format!(
                "operator state is {}, expected {}",
                found,
                std::any::type_name::<S>()
            ))
        })
    }

    /// Mutably borrow the concrete state
    pub fn downcast_mut<S: 'static>(&mut self) -> BspResult<&mut S> {
        let found = self.0.type_name();
        self.0.as_any_mut().downcast_mut::<S>().ok_or_else(|| {
            BspError::processing(format!(
                "operator state is {}, expected {}",
                found,
                std::any::type_name::<S>()
            ))
        })
    }

    /// Serialized form, used for comparing states across ticks
    pub fn snapshot(&self) -> serde_json::Value {
        self.0.snapshot()
    }
}

impl Clone for OperatorState {
    fn clone(&self) -> Self {
        OperatorState(self.0.clone_box())
    }
}

impl fmt::Debug for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperatorState").field(&self.0.type_name()).finish()
    }
}

/// Parameter value types for flexible configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl ParameterValue {
    /// Convert to f64 if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Convert to i64 if possible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            ParameterValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Convert to bool if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            ParameterValue::StringArray(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<f32> for ParameterValue {
    fn from(value: f32) -> Self {
        ParameterValue::Float(value as f64)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Integer(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Integer(value as i64)
    }
}

impl From<usize> for ParameterValue {
    fn from(value: usize) -> Self {
        ParameterValue::Integer(value as i64)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Boolean(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::FloatArray(value)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(value: Vec<String>) -> Self {
        ParameterValue::StringArray(value)
    }
}

impl From<&[&str]> for ParameterValue {
    fn from(value: &[&str]) -> Self {
        ParameterValue::StringArray(value.iter().map(|s| s.to_string()).collect())
    }
}

/// Operator name plus its parameters, as stored in a calibrated filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Catalog name of the operator
    pub name: String,
    /// Operator parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    /// Force stateful handling regardless of the catalog default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,
}

impl OperatorConfig {
    /// Create new operator configuration
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: BTreeMap::new(),
            stateful: None,
        }
    }

    /// Builder-style parameter setter
    pub fn with(mut self, key: &str, value: impl Into<ParameterValue>) -> Self {
        self.set_parameter(key, value.into());
        self
    }

    /// Set a parameter value
    pub fn set_parameter(&mut self, key: &str, value: ParameterValue) {
        self.parameters.insert(key.to_string(), value);
    }

    /// Get a parameter value
    pub fn get_parameter(&self, key: &str) -> Option<&ParameterValue> {
        self.parameters.get(key)
    }

    /// Get float parameter with default
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get_parameter(key)
            .and_then(ParameterValue::as_float)
            .unwrap_or(default)
    }

    /// Get integer parameter with default
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_parameter(key)
            .and_then(ParameterValue::as_int)
            .unwrap_or(default)
    }

    /// Get boolean parameter with default
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_parameter(key)
            .and_then(ParameterValue::as_bool)
            .unwrap_or(default)
    }

    /// Required float parameter
    pub fn require_float(&self, key: &str) -> BspResult<f64> {
        self.get_parameter(key)
            .and_then(ParameterValue::as_float)
            .ok_or_else(|| self.missing(key, "a number"))
    }

    /// Required non-negative integer parameter
    pub fn require_usize(&self, key: &str) -> BspResult<usize> {
        self.get_parameter(key)
            .and_then(ParameterValue::as_int)
            .filter(|v| *v >= 0)
            .map(|v| v as usize)
            .ok_or_else(|| self.missing(key, "a non-negative integer"))
    }

    /// Required list of strings
    pub fn require_strings(&self, key: &str) -> BspResult<Vec<String>> {
        self.get_parameter(key)
            .and_then(ParameterValue::as_strings)
            .map(|v| v.to_vec())
            .ok_or_else(|| self.missing(key, "a list of strings"))
    }

    fn missing(&self, key: &str, what: &str) -> BspError {
        BspError::configuration(format!(
            "operator '{}' requires parameter '{}' ({})",
            self.name, key, what
        ))
    }

    /// Validate configuration
    pub fn validate(&self) -> BspResult<()> {
        if self.name.is_empty() {
            return Err(BspError::configuration("Operator name cannot be empty"));
        }
        Ok(())
    }
}

/// Performance metrics for one operator invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// Actual processing time in microseconds
    pub processing_time_us: u64,
    /// Samples consumed across all inputs
    pub samples_in: usize,
    /// Samples produced
    pub samples_out: usize,
    /// Success/failure status
    pub success: bool,
    /// Error message if processing failed
    pub error_message: Option<String>,
}

impl ProcessingMetrics {
    /// Start timing a processing operation
    pub fn start_timing() -> ProcessingTimer {
        ProcessingTimer {
            start_time: Instant::now(),
            metrics: ProcessingMetrics {
                success: true,
                ..Default::default()
            },
        }
    }
}

/// Helper for timing processing operations
pub struct ProcessingTimer {
    start_time: Instant,
    metrics: ProcessingMetrics,
}

impl ProcessingTimer {
    /// Record input size
    pub fn set_samples_in(&mut self, samples: usize) {
        self.metrics.samples_in = samples;
    }

    /// Finish timing and return metrics
    pub fn finish(mut self, samples_out: usize) -> ProcessingMetrics {
        self.metrics.processing_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics.samples_out = samples_out;
        self.metrics
    }

    /// Finish with error
    pub fn finish_with_error(mut self, error: &str) -> ProcessingMetrics {
        self.metrics.processing_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics.success = false;
        self.metrics.error_message = Some(error.to_string());
        self.metrics
    }
}

/// Ensure a pure operator received the expected number of inputs
pub fn expect_inputs<T>(operator: &str, inputs: &[T], expected: usize) -> BspResult<()> {
    if inputs.len() != expected {
        return Err(BspError::shape(
            format!("inputs of operator '{}'", operator),
            expected,
            inputs.len(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Serialize)]
    struct Counter {
        count: u32,
    }

    #[test]
    fn test_operator_config() {
        let mut config = OperatorConfig::new("band_power")
            .with("low", 8.0)
            .with("order", 2i64);
        config.set_parameter("log", ParameterValue::Boolean(false));

        assert_eq!(config.get_float("low", 0.0), 8.0);
        assert_eq!(config.get_int("order", 0), 2);
        assert!(!config.get_bool("log", true));
        assert_eq!(config.require_usize("order").unwrap(), 2);
        assert!(matches!(
            config.require_float("missing"),
            Err(BspError::Configuration { .. })
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parameter_json_is_untagged() {
        let config = OperatorConfig::new("select_channels")
            .with("channels", &["C3", "C4"][..])
            .with("gain", 2.5);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""channels":["C3","C4"]"#));

        let parsed: OperatorConfig = serde_json::from_str(
            r#"{"name":"scale","parameters":{"factor":4,"offset":0.5}}"#,
        ).unwrap();
        assert_eq!(parsed.get_parameter("factor"), Some(&ParameterValue::Integer(4)));
        assert_eq!(parsed.get_float("offset", 0.0), 0.5);
        assert_eq!(parsed.stateful, None);
    }

    #[test]
    fn test_state_downcast_and_snapshot() {
        let mut state = OperatorState::new(Counter { count: 1 });
        let before = state.clone();

        state.downcast_mut::<Counter>().unwrap().count += 1;
        assert_eq!(state.downcast_ref::<Counter>().unwrap().count, 2);
        assert_eq!(before.snapshot(), serde_json::json!({ "count": 1 }));
        assert!(matches!(
            state.downcast_ref::<u64>(),
            Err(BspError::Processing { .. })
        ));
    }

    #[test]
    fn test_processing_timer() {
        let mut timer = ProcessingMetrics::start_timing();
        timer.set_samples_in(10);
        let metrics = timer.finish(8);

        assert!(metrics.success);
        assert_eq!(metrics.samples_in, 10);
        assert_eq!(metrics.samples_out, 8);
        assert!(metrics.error_message.is_none());
    }
}
