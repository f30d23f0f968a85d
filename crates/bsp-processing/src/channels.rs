//! Channel-space operators: selection, re-referencing, scaling and merging

use crate::processor::{expect_inputs, OperatorState, PureOperator, StatefulOperator};
use bsp_core::{BspError, BspResult, SignalBlock, SignalKind, StreamInfo};
use serde::Serialize;
use tracing::warn;

fn check_channels(operator: &str, block: &SignalBlock, expected: usize) -> BspResult<()> {
    if block.channel_count() != expected {
        return Err(BspError::shape(
            format!("input channels of '{}'", operator),
            expected,
            block.channel_count(),
        ));
    }
    Ok(())
}

fn resolve_labels(operator: &str, input: &StreamInfo, labels: &[String]) -> BspResult<Vec<usize>> {
    labels
        .iter()
        .map(|label| {
            input.channel_index(label).ok_or_else(|| BspError::NotFound {
                kind: "channel",
                name: label.clone(),
                hint: Some(format!(
                    "operator '{}' input carries [{}]",
                    operator,
                    input.labels().join(", ")
                )),
            })
        })
        .collect()
}

/// Keep the listed channels, in the listed order
#[derive(Debug, Clone)]
pub struct SelectChannels {
    name: String,
    indices: Vec<usize>,
    input_channels: usize,
    layout: StreamInfo,
}

impl SelectChannels {
    pub fn new(name: &str, labels: &[String], input: &StreamInfo) -> BspResult<Self> {
        if labels.is_empty() {
            return Err(BspError::configuration(format!("{}: no channels selected", name)));
        }
        let indices = resolve_labels(name, input, labels)?;
        Ok(SelectChannels {
            name: name.to_string(),
            layout: input.select(&indices),
            indices,
            input_channels: input.channel_count(),
        })
    }
}

impl PureOperator for SelectChannels {
    fn name(&self) -> &str {
        &self.name
    }

    fn preserves_samples(&self) -> bool {
        true
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(self.layout.clone())
    }

    fn apply(&self, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        check_channels(&self.name, &inputs[0], self.input_channels)?;
        inputs[0].select_channels(&self.indices)
    }
}

/// Re-reference to the average of a set of reference channels
#[derive(Debug, Clone)]
pub struct Rereference {
    name: String,
    reference: Vec<usize>,
    input_channels: usize,
}

impl Rereference {
    /// Common average reference when `reference` is `None`
    pub fn new(name: &str, reference: Option<&[String]>, input: &StreamInfo) -> BspResult<Self> {
        let reference = match reference {
            Some(labels) if !labels.is_empty() => resolve_labels(name, input, labels)?,
            Some(_) => {
                return Err(BspError::configuration(format!("{}: empty reference set", name)))
            }
            None => (0..input.channel_count()).collect(),
        };
        Ok(Rereference {
            name: name.to_string(),
            reference,
            input_channels: input.channel_count(),
        })
    }
}

impl PureOperator for Rereference {
    fn name(&self) -> &str {
        &self.name
    }

    fn preserves_samples(&self) -> bool {
        true
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn apply(&self, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        let input = &inputs[0];
        check_channels(&self.name, input, self.input_channels)?;

        let mut data = Vec::with_capacity(input.data().len());
        for frame in input.frames() {
            let mean = self.reference.iter().map(|&i| frame[i]).sum::<f32>()
                / self.reference.len() as f32;
            data.extend(frame.iter().map(|&x| x - mean));
        }
        SignalBlock::new(data, input.channel_count(), input.sampling_rate())
    }
}

/// Affine rescaling `x * factor + offset`
#[derive(Debug, Clone)]
pub struct Scale {
    name: String,
    factor: f32,
    offset: f32,
}

impl Scale {
    pub fn new(name: &str, factor: f32, offset: f32) -> BspResult<Self> {
        if !factor.is_finite() || !offset.is_finite() {
            return Err(BspError::configuration(format!(
                "{}: factor and offset must be finite",
                name
            )));
        }
        Ok(Scale {
            name: name.to_string(),
            factor,
            offset,
        })
    }
}

impl PureOperator for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn preserves_samples(&self) -> bool {
        true
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn apply(&self, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, 1)?;
        let input = &inputs[0];
        let data = input.data().iter().map(|&x| x * self.factor + self.offset).collect();
        SignalBlock::new(data, input.channel_count(), input.sampling_rate())
    }
}

#[derive(Debug, Clone, Serialize)]
struct MergeState {
    backlog: Vec<SignalBlock>,
    /// Held-back samples discarded because a backlog overflowed
    dropped: u64,
}

/// Concatenate the channels of several inputs.
///
/// Inputs may deliver different numbers of new samples per tick (for example
/// when they come from different streams); samples without a partner yet are
/// held back until every input has caught up. A backlog never exceeds
/// `max_backlog` samples; when one input stalls, the oldest held-back samples
/// of the others are dropped.
#[derive(Debug, Clone)]
pub struct Merge {
    name: String,
    channel_counts: Vec<usize>,
    layout: StreamInfo,
    max_backlog: usize,
}

/// Default backlog bound, in seconds of input
pub const MERGE_BACKLOG_SECONDS: f32 = 10.0;

impl Merge {
    pub fn new(name: &str, inputs: &[StreamInfo]) -> BspResult<Self> {
        let first = inputs.first().ok_or_else(|| {
            BspError::configuration(format!("{}: needs at least one input", name))
        })?;

        if let Some(other) = inputs.iter().find(|i| i.sampling_rate != first.sampling_rate) {
            return Err(BspError::configuration(format!(
                "{}: inputs run at different sampling rates ({} Hz and {} Hz)",
                name, first.sampling_rate, other.sampling_rate
            )));
        }

        let channels = inputs.iter().flat_map(|i| i.channels.iter().cloned()).collect();
        let kind = if inputs.iter().all(|i| i.kind == first.kind) {
            first.kind
        } else {
            SignalKind::Derived
        };
        let layout = StreamInfo::with_locations(kind, first.sampling_rate, channels)
            .map_err(|e| BspError::configuration(format!("{}: {}", name, e)))?;

        Ok(Merge {
            name: name.to_string(),
            channel_counts: inputs.iter().map(StreamInfo::channel_count).collect(),
            max_backlog: ((first.sampling_rate * MERGE_BACKLOG_SECONDS).ceil() as usize).max(1),
            layout,
        })
    }

    /// Bound each input's backlog to `samples`
    pub fn with_max_backlog(mut self, samples: usize) -> BspResult<Self> {
        if samples == 0 {
            return Err(BspError::configuration(format!(
                "{}: max_backlog must be at least one sample",
                self.name
            )));
        }
        self.max_backlog = samples;
        Ok(self)
    }

    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }
}

impl StatefulOperator for Merge {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_layout(&self, inputs: &[StreamInfo]) -> BspResult<StreamInfo> {
        expect_inputs(&self.name, inputs, self.channel_counts.len())?;
        Ok(self.layout.clone())
    }

    fn init_state(&self, inputs: &[StreamInfo]) -> BspResult<OperatorState> {
        expect_inputs(&self.name, inputs, self.channel_counts.len())?;
        Ok(OperatorState::new(MergeState {
            backlog: inputs
                .iter()
                .map(|i| SignalBlock::empty(i.channel_count(), i.sampling_rate))
                .collect(),
            dropped: 0,
        }))
    }

    fn apply(&self, state: &mut OperatorState, inputs: &[SignalBlock]) -> BspResult<SignalBlock> {
        expect_inputs(&self.name, inputs, self.channel_counts.len())?;
        let state = state.downcast_mut::<MergeState>()?;

        for ((backlog, input), &channels) in state.backlog.iter_mut().zip(inputs).zip(&self.channel_counts) {
            check_channels(&self.name, input, channels)?;
            backlog.extend(input)?;
        }

        let ready = state.backlog.iter().map(SignalBlock::samples).min().unwrap_or(0);
        let parts: Vec<SignalBlock> = state.backlog.iter_mut().map(|b| b.take_front(ready)).collect();

        for (input, backlog) in state.backlog.iter_mut().enumerate() {
            let excess = backlog.samples().saturating_sub(self.max_backlog);
            if excess > 0 {
                backlog.take_front(excess);
                state.dropped += excess as u64;
                warn!(
                    operator = %self.name,
                    input,
                    dropped = excess,
                    total_dropped = state.dropped,
                    "Merge input stalled; dropping oldest held-back samples"
                );
            }
        }

        let mut data = Vec::with_capacity(ready * self.layout.channel_count());
        for sample in 0..ready {
            for part in &parts {
                data.extend_from_slice(part.frame(sample));
            }
        }
        SignalBlock::new(data, self.layout.channel_count(), self.layout.sampling_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(labels: &[&str]) -> StreamInfo {
        StreamInfo::new(SignalKind::Eeg, 100.0, labels).unwrap()
    }

    fn labels(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_channels() {
        let input = info(&["C3", "Cz", "C4"]);
        let op = SelectChannels::new("select_channels", &labels(&["C4", "C3"]), &input).unwrap();
        assert_eq!(op.output_layout(&[input]).unwrap().labels(), vec!["C4", "C3"]);

        let block = SignalBlock::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 100.0).unwrap();
        assert_eq!(op.apply(&[block]).unwrap().data(), &[3.0, 1.0, 6.0, 4.0]);
    }

    #[test]
    fn test_select_unknown_channel() {
        let input = info(&["C3"]);
        assert!(matches!(
            SelectChannels::new("select_channels", &labels(&["Pz"]), &input),
            Err(BspError::NotFound { kind: "channel", .. })
        ));
    }

    #[test]
    fn test_common_average_reference() {
        let input = info(&["a", "b", "c"]);
        let op = Rereference::new("rereference", None, &input).unwrap();
        let block = SignalBlock::new(vec![1.0, 2.0, 3.0], 3, 100.0).unwrap();
        assert_eq!(op.apply(&[block]).unwrap().data(), &[-1.0, 0.0, 1.0]);

        let linked = Rereference::new("rereference", Some(&labels(&["a"])), &input).unwrap();
        let block = SignalBlock::new(vec![1.0, 2.0, 3.0], 3, 100.0).unwrap();
        assert_eq!(linked.apply(&[block]).unwrap().data(), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_scale() {
        let op = Scale::new("scale", 2.0, 1.0).unwrap();
        let block = SignalBlock::new(vec![0.0, 1.5], 1, 100.0).unwrap();
        assert_eq!(op.apply(&[block]).unwrap().data(), &[1.0, 4.0]);
        assert!(Scale::new("scale", f32::NAN, 0.0).is_err());
    }

    #[test]
    fn test_merge_holds_back_unpaired_samples() {
        let left = info(&["C3"]);
        let right = info(&["C4", "Cz"]);
        let op = Merge::new("merge", &[left.clone(), right.clone()]).unwrap();
        assert_eq!(
            op.output_layout(&[left.clone(), right.clone()]).unwrap().labels(),
            vec!["C3", "C4", "Cz"]
        );

        let mut state = op.init_state(&[left, right]).unwrap();
        let a = SignalBlock::new(vec![1.0, 2.0, 3.0], 1, 100.0).unwrap();
        let b = SignalBlock::new(vec![10.0, 11.0], 2, 100.0).unwrap();
        let out = op.apply(&mut state, &[a, b]).unwrap();
        assert_eq!(out.data(), &[1.0, 10.0, 11.0]);

        let a = SignalBlock::empty(1, 100.0);
        let b = SignalBlock::new(vec![20.0, 21.0, 30.0, 31.0, 40.0, 41.0], 2, 100.0).unwrap();
        let out = op.apply(&mut state, &[a, b]).unwrap();
        assert_eq!(out.data(), &[2.0, 20.0, 21.0, 3.0, 30.0, 31.0]);
    }

    #[test]
    fn test_merge_backlog_is_bounded() {
        let left = info(&["C3"]);
        let right = info(&["C4"]);
        let op = Merge::new("merge", &[left.clone(), right.clone()])
            .unwrap()
            .with_max_backlog(5)
            .unwrap();
        let mut state = op.init_state(&[left, right]).unwrap();

        // The right input never delivers
        for tick in 0..4 {
            let a = SignalBlock::new(vec![tick as f32; 3], 1, 100.0).unwrap();
            let out = op.apply(&mut state, &[a, SignalBlock::empty(1, 100.0)]).unwrap();
            assert!(out.is_empty());
        }

        let held = state.downcast_ref::<MergeState>().unwrap();
        assert_eq!(held.backlog[0].samples(), 5);
        assert_eq!(held.dropped, 7);
        assert_eq!(held.backlog[0].data(), &[2.0, 2.0, 3.0, 3.0, 3.0]);

        assert!(Merge::new("merge", &[info(&["C3"])]).unwrap().with_max_backlog(0).is_err());
        assert_eq!(Merge::new("merge", &[info(&["C3"])]).unwrap().max_backlog(), 1000);
    }

    #[test]
    fn test_merge_rejects_mismatched_inputs() {
        let slow = StreamInfo::new(SignalKind::Eeg, 50.0, &["C4"]).unwrap();
        assert!(Merge::new("merge", &[info(&["C3"]), slow]).is_err());
        assert!(Merge::new("merge", &[info(&["C3"]), info(&["C3"])]).is_err());
    }
}
