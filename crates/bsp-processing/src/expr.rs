//! Calibrated filter expressions
//!
//! A filter expression is the tree of operator applications produced by
//! offline calibration. Leaves name the raw channels they were calibrated on.

use crate::processor::OperatorConfig;
use bsp_core::{BspError, BspResult};
use serde::{Deserialize, Serialize};

/// A tree of filter applications over raw data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterExpr {
    /// Raw stream data with the channel labels used during calibration
    RawData {
        channels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        srate: Option<f32>,
    },
    /// Operator applied to the outputs of sub-expressions
    Apply {
        operator: OperatorConfig,
        inputs: Vec<FilterExpr>,
    },
}

impl FilterExpr {
    /// Raw-data leaf
    pub fn raw<S: AsRef<str>>(channels: &[S], srate: Option<f32>) -> Self {
        FilterExpr::RawData {
            channels: channels.iter().map(|c| c.as_ref().to_string()).collect(),
            srate,
        }
    }

    /// Apply an operator to several inputs
    pub fn apply(operator: OperatorConfig, inputs: Vec<FilterExpr>) -> Self {
        FilterExpr::Apply { operator, inputs }
    }

    /// Apply a single-input operator on top of this expression
    pub fn then(self, operator: OperatorConfig) -> Self {
        FilterExpr::Apply {
            operator,
            inputs: vec![self],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, FilterExpr::RawData { .. })
    }

    /// All raw-data leaves, left to right
    pub fn leaves(&self) -> Vec<&FilterExpr> {
        match self {
            FilterExpr::RawData { .. } => vec![self],
            FilterExpr::Apply { inputs, .. } => inputs.iter().flat_map(FilterExpr::leaves).collect(),
        }
    }

    /// Number of operator applications
    pub fn operator_count(&self) -> usize {
        match self {
            FilterExpr::RawData { .. } => 0,
            FilterExpr::Apply { inputs, .. } => {
                1 + inputs.iter().map(FilterExpr::operator_count).sum::<usize>()
            }
        }
    }

    /// Structural key; identical sub-expressions produce identical keys
    pub fn key(&self) -> BspResult<String> {
        serde_json::to_string(self).map_err(|e| BspError::processing(e.to_string()))
    }

    /// Check the expression is well formed
    pub fn validate(&self) -> BspResult<()> {
        match self {
            FilterExpr::RawData { channels, srate } => {
                if channels.is_empty() {
                    return Err(BspError::configuration("raw data leaf lists no channels"));
                }
                if let Some(rate) = srate {
                    bsp_core::StreamInfo::validate_sampling_rate(*rate)?;
                }
                Ok(())
            }
            FilterExpr::Apply { operator, inputs } => {
                operator.validate()?;
                if inputs.is_empty() {
                    return Err(BspError::configuration(format!(
                        "operator '{}' has no inputs",
                        operator.name
                    )));
                }
                inputs.iter().try_for_each(FilterExpr::validate)
            }
        }
    }

    /// Export expression to JSON
    pub fn to_json(&self) -> BspResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            BspError::configuration(format!("Failed to serialize filter expression: {}", e))
        })
    }

    /// Import expression from JSON
    pub fn from_json(json: &str) -> BspResult<Self> {
        let expr: FilterExpr = serde_json::from_str(json).map_err(|e| {
            BspError::configuration(format!("Failed to deserialize filter expression: {}", e))
        })?;
        expr.validate()?;
        Ok(expr)
    }
}
