//! Named predictors: a model plus the live pipeline feeding it

use crate::model::{OutputFormat, OutputValue, PredictionModel};
use bsp_core::{BspError, BspResult, ChannelSubset, StreamRegistry, WindowUnit};
use bsp_processing::{Pipeline, PipelineBuilder, PipelineConfig, PipelinePerformance, TickOutput};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Identity token of a predictor; a new one is issued whenever a name is rebound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictorId(Uuid);

impl PredictorId {
    pub fn new() -> Self {
        PredictorId(Uuid::new_v4())
    }
}

impl Default for PredictorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PredictorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A calibrated model bound to live streams through its own pipeline
pub struct Predictor {
    id: PredictorId,
    name: String,
    model: Arc<dyn PredictionModel>,
    pipeline: Mutex<Pipeline>,
}

impl Predictor {
    /// Build the model's filter pipeline against `streams` and wrap it as a predictor
    pub fn new<S: AsRef<str>>(
        name: &str,
        model: Arc<dyn PredictionModel>,
        registry: Arc<StreamRegistry>,
        stream_names: &[S],
        config: PipelineConfig,
    ) -> BspResult<Self> {
        if name.is_empty() {
            return Err(BspError::invalid_argument("predictor_name", "predictor name cannot be empty"));
        }

        let pipeline = PipelineBuilder::new(model.filter_expr().clone())
            .name(name)
            .streams(stream_names)
            .needed_channels(model.needed_channels())
            .config(config)
            .build(registry)?;

        Ok(Predictor {
            id: PredictorId::new(),
            name: name.to_string(),
            model,
            pipeline: Mutex::new(pipeline),
        })
    }

    pub fn id(&self) -> PredictorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Arc<dyn PredictionModel> {
        &self.model
    }

    /// Pull new samples through the pipeline
    pub fn update(&self) -> BspResult<TickOutput> {
        self.pipeline.lock().update()
    }

    /// Predict from the latest output window, without updating the pipeline
    pub fn predict(&self, format: OutputFormat) -> BspResult<Option<OutputValue>> {
        let channels = match self.model.needed_channels() {
            [] => ChannelSubset::All,
            labels => ChannelSubset::labels(labels),
        };
        let window = self
            .pipeline
            .lock()
            .peek_output(self.model.window_seconds(), WindowUnit::Seconds, &channels)?;

        match self.model.predict(&window)? {
            Some(distribution) => Ok(Some(format.format(&distribution, self.model.classes())?)),
            None => Ok(None),
        }
    }

    /// Update, then predict
    pub fn update_and_predict(&self, format: OutputFormat) -> BspResult<Option<OutputValue>> {
        self.update()?;
        self.predict(format)
    }

    /// Get pipeline performance summary
    pub fn performance_summary(&self) -> PipelinePerformance {
        self.pipeline.lock().performance_summary()
    }
}

impl fmt::Debug for Predictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predictor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model.name())
            .finish()
    }
}

/// Process-wide predictors by name
#[derive(Debug, Default)]
pub struct PredictorRegistry {
    predictors: RwLock<HashMap<String, Arc<Predictor>>>,
}

impl PredictorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predictor under its own name; returns the binding it replaced
    pub fn insert(&self, predictor: Arc<Predictor>) -> Option<Arc<Predictor>> {
        let previous = self
            .predictors
            .write()
            .insert(predictor.name().to_string(), Arc::clone(&predictor));

        match &previous {
            Some(old) => info!(
                predictor = predictor.name(),
                old_id = %old.id(),
                new_id = %predictor.id(),
                "Predictor replaced"
            ),
            None => info!(
                predictor = predictor.name(),
                id = %predictor.id(),
                model = predictor.model().name(),
                "Predictor created"
            ),
        }
        previous
    }

    /// Look up a predictor by name
    pub fn get(&self, name: &str) -> BspResult<Arc<Predictor>> {
        self.predictors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BspError::NotFound {
                kind: "predictor",
                name: name.to_string(),
                hint: Some("create the predictor before using it".to_string()),
            })
    }

    /// Look up a predictor and verify it is still the binding identified by `expected`
    pub fn get_bound(&self, name: &str, expected: PredictorId) -> BspResult<Arc<Predictor>> {
        let predictor = self.get(name)?;
        if predictor.id() != expected {
            return Err(BspError::StaleBinding {
                kind: "predictor",
                name: name.to_string(),
                expected: expected.to_string(),
                found: predictor.id().to_string(),
            });
        }
        Ok(predictor)
    }

    /// Remove a binding
    pub fn remove(&self, name: &str) -> Option<Arc<Predictor>> {
        let removed = self.predictors.write().remove(name);
        if removed.is_some() {
            info!(predictor = name, "Predictor deleted");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predictors.read().contains_key(name)
    }

    /// Registered predictor names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.predictors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearModel;
    use bsp_core::{SignalBlock, SignalKind, StreamInfo};
    use bsp_processing::FilterExpr;

    fn registry() -> Arc<StreamRegistry> {
        let registry = Arc::new(StreamRegistry::new());
        let info = StreamInfo::new(SignalKind::Eeg, 100.0, &["C3", "C4"]).unwrap();
        registry.open("eeg", info, 500, 16).unwrap();
        registry
    }

    fn model() -> Arc<dyn PredictionModel> {
        Arc::new(LinearModel {
            name: "lateral".to_string(),
            filter: FilterExpr::raw(&["C3", "C4"], Some(100.0)),
            channels: vec!["C3".to_string(), "C4".to_string()],
            window: 0.1,
            classes: vec!["left".to_string(), "right".to_string()],
            weights: vec![vec![1.0, -1.0], vec![-1.0, 1.0]],
            bias: vec![0.0, 0.0],
        })
    }

    fn append(registry: &StreamRegistry, frames: usize, c3: f32, c4: f32) {
        let data = (0..frames).flat_map(|_| [c3, c4]).collect();
        let block = SignalBlock::new(data, 2, 100.0).unwrap();
        registry.get("eeg").unwrap().append(&block, &[]).unwrap();
    }

    #[test]
    fn test_predict_after_enough_data() {
        let registry = registry();
        let predictor =
            Predictor::new("p", model(), Arc::clone(&registry), &["eeg"], PipelineConfig::default()).unwrap();

        append(&registry, 5, 0.0, 1.0);
        assert_eq!(predictor.update_and_predict(OutputFormat::Mode).unwrap(), None);

        append(&registry, 5, 0.0, 1.0);
        assert_eq!(
            predictor.update_and_predict(OutputFormat::Mode).unwrap(),
            Some(OutputValue::Mode("right".to_string()))
        );
        assert_eq!(predictor.performance_summary().samples_out, 10);
    }

    #[test]
    fn test_registry_identity() {
        let registry = registry();
        let predictors = PredictorRegistry::new();

        let first = Arc::new(
            Predictor::new("p", model(), Arc::clone(&registry), &["eeg"], PipelineConfig::default()).unwrap(),
        );
        let first_id = first.id();
        assert!(predictors.insert(first).is_none());
        assert!(predictors.get_bound("p", first_id).is_ok());

        let second = Arc::new(
            Predictor::new("p", model(), Arc::clone(&registry), &["eeg"], PipelineConfig::default()).unwrap(),
        );
        assert!(predictors.insert(second).is_some());
        assert!(matches!(
            predictors.get_bound("p", first_id),
            Err(BspError::StaleBinding { kind: "predictor", .. })
        ));

        predictors.remove("p");
        assert!(matches!(
            predictors.get_bound("p", first_id),
            Err(BspError::NotFound { kind: "predictor", .. })
        ));
        assert!(predictors.names().is_empty());
    }

    #[test]
    fn test_missing_stream_fails_construction() {
        let registry = registry();
        let result = Predictor::new("p", model(), registry, &["emg"], PipelineConfig::default());
        assert!(matches!(result, Err(BspError::NotFound { .. })));
    }
}
