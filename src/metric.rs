use burn::{
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
    train::{
        metric::{
            state::{FormatOptions, NumericMetricState},
            AccuracyInput, Adaptor, LossInput, Metric, MetricEntry, MetricMetadata, Numeric,
        },
        ClassificationOutput, RegressionOutput,
    },
};

/// Counts behind one batch's F-score.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FScoreInput {
    pub true_positives: usize,
    pub predicted: usize,
    pub expected: usize,
    pub batch_size: usize,
}

impl FScoreInput {
    pub fn fscore(&self) -> f64 {
        let precision = ratio(self.true_positives, self.predicted);
        let recall = ratio(self.true_positives, self.expected);
        if precision + recall == 0.0 {
            return 0.0;
        }

        2.0 * precision * recall / (precision + recall)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn count<B: Backend>(mask: Tensor<B, 1, Int>) -> usize {
    mask.sum().into_scalar().elem::<i64>() as usize
}

/// Sequence positions: `<PAD>` targets are ignored, predicting `<PAD>` is
/// not a positive.
pub fn sequence_fscore_input<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    pad_token: usize,
    batch_size: usize,
) -> FScoreInput {
    let predictions = output.argmax(1).flatten::<1>(0, 1);
    let predicted = predictions
        .clone()
        .equal_elem(pad_token as i64)
        .bool_not()
        .int();
    let expected = targets
        .clone()
        .equal_elem(pad_token as i64)
        .bool_not()
        .int();
    let hits = predictions.equal(targets).int() * expected.clone();

    FScoreInput {
        true_positives: count(hits),
        predicted: count(predicted),
        expected: count(expected),
        batch_size,
    }
}

/// Heat-map pixels: a positive is a score above `threshold`.
pub fn heatmap_fscore_input<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    threshold: f32,
) -> FScoreInput {
    let batch_size = output.dims()[0];
    let predicted = output.greater_elem(threshold).int().flatten::<1>(0, 1);
    let expected = targets.greater_elem(threshold).int().flatten::<1>(0, 1);
    let hits = predicted.clone() * expected.clone();

    FScoreInput {
        true_positives: count(hits),
        predicted: count(predicted),
        expected: count(expected),
        batch_size,
    }
}

/// Recognizer outputs are `[batch * steps, classes]`; the padding id is the
/// one the loss ignores.
pub struct SequenceOutput<B: Backend> {
    pub classification: ClassificationOutput<B>,
    pub batch_size: usize,
    pub pad_token: usize,
}

impl<B: Backend> Adaptor<FScoreInput> for SequenceOutput<B> {
    fn adapt(&self) -> FScoreInput {
        sequence_fscore_input(
            self.classification.output.clone(),
            self.classification.targets.clone(),
            self.pad_token,
            self.batch_size,
        )
    }
}

impl<B: Backend> Adaptor<AccuracyInput<B>> for SequenceOutput<B> {
    fn adapt(&self) -> AccuracyInput<B> {
        self.classification.adapt()
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SequenceOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        self.classification.adapt()
    }
}

pub struct HeatmapOutput<B: Backend> {
    pub regression: RegressionOutput<B>,
    pub threshold: f32,
}

impl<B: Backend> Adaptor<FScoreInput> for HeatmapOutput<B> {
    fn adapt(&self) -> FScoreInput {
        heatmap_fscore_input(
            self.regression.output.clone(),
            self.regression.targets.clone(),
            self.threshold,
        )
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for HeatmapOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        self.regression.adapt()
    }
}

/// The F-score monitored for checkpointing, averaged over an epoch by batch
/// size.
pub struct FScoreMetric {
    state: NumericMetricState,
}

impl FScoreMetric {
    pub fn new() -> Self {
        Self {
            state: NumericMetricState::new(),
        }
    }
}

impl Default for FScoreMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for FScoreMetric {
    const NAME: &'static str = "FScore";

    type Input = FScoreInput;

    fn update(&mut self, item: &FScoreInput, _metadata: &MetricMetadata) -> MetricEntry {
        self.state.update(
            item.fscore(),
            item.batch_size,
            FormatOptions::new(Self::NAME).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl Numeric for FScoreMetric {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
