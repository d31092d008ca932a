use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::Conv2d,
        loss::{MseLoss, Reduction},
    },
    tensor::{
        activation,
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
    train::{RegressionOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::{
    burn_ext::utils::{convolution, ConvBlock},
    craft_dataset::CraftBatch,
    metric::HeatmapOutput,
};

#[derive(Config, Debug)]
pub struct DetectorConfig {
    #[config(default = 64)]
    channels: usize,
    #[config(default = 0.4)]
    score_threshold: f32,
}

impl DetectorConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Detector<B> {
        let wide = self.channels * 2;

        Detector {
            stem: ConvBlock::new(device, 3, self.channels, [1, 1], None),
            down: ConvBlock::new(device, self.channels, wide, [2, 2], None),
            body: ConvBlock::new(device, wide, wide, [1, 1], None),
            head: convolution(device, wide, 2, [1, 1], [1, 1], [0, 0], true),
            score_threshold: self.score_threshold,
        }
    }
}

/// Fully convolutional baseline predicting region and affinity scores at
/// half the input resolution.
#[derive(Module, Debug)]
pub struct Detector<B: Backend> {
    pub stem: ConvBlock<B>,
    pub down: ConvBlock<B>,
    pub body: ConvBlock<B>,
    pub head: Conv2d<B>,
    score_threshold: f32,
}

impl<B: Backend> Detector<B> {
    /// `[batch, 3, S, S]` -> `[batch, 2, S/2, S/2]`, values in `(0, 1)`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(images);
        let x = self.down.forward(x);
        let x = self.body.forward(x);

        activation::sigmoid(self.head.forward(x))
    }

    pub fn forward_regression(
        &self,
        images: Tensor<B, 4>,
        score_maps: Tensor<B, 4>,
    ) -> HeatmapOutput<B> {
        let device = &self.devices()[0];
        let images = images.to_device(device);
        let score_maps = score_maps.to_device(device);

        let output = self.forward(images).flatten::<2>(1, 3);
        let targets = score_maps.flatten::<2>(1, 3);
        let loss = MseLoss::new().forward(output.clone(), targets.clone(), Reduction::Mean);

        HeatmapOutput {
            regression: RegressionOutput::new(loss, output, targets),
            threshold: self.score_threshold,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<CraftBatch<B>, HeatmapOutput<B>> for Detector<B> {
    fn step(&self, batch: CraftBatch<B>) -> TrainOutput<HeatmapOutput<B>> {
        let item = self.forward_regression(batch.images, batch.score_maps);

        TrainOutput::new(self, item.regression.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<CraftBatch<B>, HeatmapOutput<B>> for Detector<B> {
    fn step(&self, batch: CraftBatch<B>) -> HeatmapOutput<B> {
        self.forward_regression(batch.images, batch.score_maps)
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    #[test]
    fn test_forward_shapes() {
        let device = NdArrayDevice::Cpu;
        let model = DetectorConfig::new().with_channels(4).init::<NdArray>(&device);
        let images = Tensor::zeros([2, 3, 32, 32], &device);

        let output = model.forward(images.clone());
        assert_eq!(output.dims(), [2, 2, 16, 16]);

        let batch = CraftBatch {
            images,
            score_maps: Tensor::zeros([2, 2, 16, 16], &device),
        };
        let item = ValidStep::step(&model, batch);
        assert_eq!(item.regression.output.dims(), [2, 512]);
        assert_eq!(item.threshold, 0.4);
    }
}
