//! Calibrated prediction models and output formatting

use bsp_core::{BspError, BspResult, Chunk};
use bsp_processing::FilterExpr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A calibrated model: the filter chain it was trained on plus a predict function
pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &str;

    /// Filter expression producing the model's input signal
    fn filter_expr(&self) -> &FilterExpr;

    /// Output channels the model reads (empty means all of them)
    fn needed_channels(&self) -> &[String];

    /// Length of the output window the model predicts from, in seconds
    fn window_seconds(&self) -> f64;

    /// Class labels, in the order of the predicted distribution
    fn classes(&self) -> &[String];

    /// Class probabilities for the given window; `None` when it holds too little data
    fn predict(&self, window: &Chunk) -> BspResult<Option<Vec<f64>>>;
}

/// How a predicted distribution is handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Full class probability vector
    #[default]
    Distribution,
    /// Probability-weighted class value
    Expectation,
    /// Most probable class label
    Mode,
}

impl FromStr for OutputFormat {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "distribution" => Ok(OutputFormat::Distribution),
            "expectation" => Ok(OutputFormat::Expectation),
            "mode" => Ok(OutputFormat::Mode),
            other => Err(BspError::invalid_argument(
                "output_format",
                format!("'{}' is not one of distribution, expectation, mode", other),
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Distribution => "distribution",
            OutputFormat::Expectation => "expectation",
            OutputFormat::Mode => "mode",
        };
        write!(f, "{}", name)
    }
}

/// Value handed to a result writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    Distribution(Vec<f64>),
    Expectation(f64),
    Mode(String),
    /// Placeholder written when no prediction could be made
    Empty,
}

impl OutputFormat {
    /// Format a class distribution
    pub fn format(&self, probabilities: &[f64], classes: &[String]) -> BspResult<OutputValue> {
        if probabilities.len() != classes.len() {
            return Err(BspError::shape("predicted distribution", classes.len(), probabilities.len()));
        }

        match self {
            OutputFormat::Distribution => Ok(OutputValue::Distribution(probabilities.to_vec())),
            OutputFormat::Expectation => {
                // Numeric class labels are used as values, otherwise the 1-based class index
                let numeric: Option<Vec<f64>> = classes.iter().map(|c| c.parse().ok()).collect();
                let values = numeric.unwrap_or_else(|| (1..=classes.len()).map(|i| i as f64).collect());
                Ok(OutputValue::Expectation(
                    probabilities.iter().zip(&values).map(|(p, v)| p * v).sum(),
                ))
            }
            OutputFormat::Mode => {
                let best = probabilities
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .ok_or_else(|| BspError::invalid_argument("classes", "model has no classes"))?;
                Ok(OutputValue::Mode(classes[best].clone()))
            }
        }
    }
}

/// Linear classifier over per-channel window means, with softmax output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub name: String,
    pub filter: FilterExpr,
    /// Output channels used as features, in weight order (empty = all output channels)
    #[serde(default)]
    pub channels: Vec<String>,
    /// Window length in seconds
    pub window: f64,
    pub classes: Vec<String>,
    /// One weight row per class, one weight per feature
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl LinearModel {
    /// Validate model
    pub fn validate(&self) -> BspResult<()> {
        self.filter.validate()?;
        if !self.window.is_finite() || self.window <= 0.0 {
            return Err(BspError::configuration(format!(
                "model '{}': window must be a positive number of seconds",
                self.name
            )));
        }
        if self.classes.is_empty() {
            return Err(BspError::configuration(format!("model '{}' has no classes", self.name)));
        }
        if self.weights.len() != self.classes.len() || self.bias.len() != self.classes.len() {
            return Err(BspError::configuration(format!(
                "model '{}': need one weight row and one bias per class",
                self.name
            )));
        }
        let features = self.weights[0].len();
        if features == 0 || self.weights.iter().any(|row| row.len() != features) {
            return Err(BspError::configuration(format!(
                "model '{}': weight rows must be non-empty and of equal length",
                self.name
            )));
        }
        if !self.channels.is_empty() && self.channels.len() != features {
            return Err(BspError::configuration(format!(
                "model '{}': {} channels but {} weights per class",
                self.name,
                self.channels.len(),
                features
            )));
        }
        Ok(())
    }

    /// Export model to JSON
    pub fn to_json(&self) -> BspResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BspError::configuration(format!("Failed to serialize model: {}", e)))
    }

    /// Import model from JSON
    pub fn from_json(json: &str) -> BspResult<Self> {
        let model: LinearModel = serde_json::from_str(json)
            .map_err(|e| BspError::configuration(format!("Failed to deserialize model: {}", e)))?;
        model.validate()?;
        Ok(model)
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

impl PredictionModel for LinearModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_expr(&self) -> &FilterExpr {
        &self.filter
    }

    fn needed_channels(&self) -> &[String] {
        &self.channels
    }

    fn window_seconds(&self) -> f64 {
        self.window
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, window: &Chunk) -> BspResult<Option<Vec<f64>>> {
        let required = (self.window * window.sampling_rate() as f64).round().max(1.0) as usize;
        if window.samples() < required {
            return Ok(None);
        }

        let features: Vec<f64> = (0..window.data.channel_count())
            .map(|c| -> BspResult<f64> {
                let data = window.data.channel_data(c)?;
                Ok(data.iter().map(|&x| x as f64).sum::<f64>() / data.len() as f64)
            })
            .collect::<BspResult<_>>()?;

        if features.len() != self.weights[0].len() {
            return Err(BspError::shape(
                format!("features of model '{}'", self.name),
                self.weights[0].len(),
                features.len(),
            ));
        }

        let scores: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&features).map(|(w, f)| w * f).sum::<f64>() + b)
            .collect();

        Ok(Some(softmax(&scores)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsp_core::{ChannelLocation, SignalBlock};

    fn classes() -> Vec<String> {
        vec!["rest".to_string(), "task".to_string()]
    }

    fn model() -> LinearModel {
        LinearModel {
            name: "test".to_string(),
            filter: FilterExpr::raw(&["C3", "C4"], Some(100.0)),
            channels: vec!["C3".to_string(), "C4".to_string()],
            window: 0.05,
            classes: classes(),
            weights: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            bias: vec![0.0, 0.0],
        }
    }

    fn chunk(frames: usize, c3: f32, c4: f32) -> Chunk {
        let data = (0..frames).flat_map(|_| [c3, c4]).collect();
        Chunk {
            data: SignalBlock::new(data, 2, 100.0).unwrap(),
            events: Vec::new(),
            xmin: 0.0,
            xmax: 0.0,
            channels: vec![ChannelLocation::unplaced("C3"), ChannelLocation::unplaced("C4")],
            first_index: 1,
            last_index: frames as u64,
        }
    }

    #[test]
    fn test_output_formats() {
        let p = [0.25, 0.75];
        assert_eq!(
            OutputFormat::Distribution.format(&p, &classes()).unwrap(),
            OutputValue::Distribution(vec![0.25, 0.75])
        );
        assert_eq!(
            OutputFormat::Expectation.format(&p, &classes()).unwrap(),
            OutputValue::Expectation(1.75)
        );
        assert_eq!(
            OutputFormat::Mode.format(&p, &classes()).unwrap(),
            OutputValue::Mode("task".to_string())
        );

        let numeric = vec!["-1".to_string(), "1".to_string()];
        assert_eq!(
            OutputFormat::Expectation.format(&p, &numeric).unwrap(),
            OutputValue::Expectation(0.5)
        );
        assert!(OutputFormat::Mode.format(&[1.0], &classes()).is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("Mode".parse::<OutputFormat>().unwrap(), OutputFormat::Mode);
        assert!(matches!(
            "median".parse::<OutputFormat>(),
            Err(BspError::InvalidArgument { argument: "output_format", .. })
        ));
    }

    #[test]
    fn test_linear_prediction() {
        let model = model();
        let p = model.predict(&chunk(5, 0.0, 2.0)).unwrap().unwrap();
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[1] > p[0]);

        // 0.05 s at 100 Hz needs five samples
        assert_eq!(model.predict(&chunk(4, 0.0, 2.0)).unwrap(), None);
    }

    #[test]
    fn test_model_validation() {
        let mut bad = model();
        bad.bias.pop();
        assert!(matches!(bad.validate(), Err(BspError::Configuration { .. })));

        let mut bad = model();
        bad.channels.push("Cz".to_string());
        assert!(bad.validate().is_err());

        let json = model().to_json().unwrap();
        assert_eq!(LinearModel::from_json(&json).unwrap(), model());
    }
}
