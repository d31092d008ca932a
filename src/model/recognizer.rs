use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::generate_autoregressive_mask,
        loss::CrossEntropyLoss,
        transformer::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput},
        Embedding, EmbeddingConfig, Linear, LinearConfig, PositionalEncoding,
        PositionalEncodingConfig,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::{
    burn_ext::utils::{max_pool_2d, ConvBlock},
    dataset::TextImgBatch,
    metric::SequenceOutput,
};

#[derive(Config, Debug)]
pub struct RecognizerConfig {
    num_classes: usize,
    padding_idx: usize,
    #[config(default = 1)]
    input_channel: usize,
    #[config(default = 256)]
    dimensions: usize,
    #[config(default = 3)]
    stacks: usize,
    #[config(default = 8)]
    n_heads: usize,
    #[config(default = 0.1)]
    dropout: f64,
    #[config(default = 1024)]
    feed_forward_size: usize,
}

impl RecognizerConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Recognizer<B> {
        let features = vec![
            ConvBlock::new(
                device,
                self.input_channel,
                64,
                [1, 1],
                Some(max_pool_2d([2, 2], [2, 2], [0, 0])),
            ),
            ConvBlock::new(device, 64, 128, [1, 1], Some(max_pool_2d([2, 2], [2, 2], [0, 0]))),
            ConvBlock::new(
                device,
                128,
                self.dimensions,
                [1, 1],
                Some(max_pool_2d([2, 1], [2, 1], [0, 0])),
            ),
        ];

        Recognizer {
            features,
            embedding: EmbeddingConfig::new(self.num_classes, self.dimensions).init(device),
            position: PositionalEncodingConfig::new(self.dimensions).init(device),
            decoder: TransformerDecoderConfig::new(
                self.dimensions,
                self.feed_forward_size,
                self.n_heads,
                self.stacks.max(1),
            )
            .with_dropout(self.dropout)
            .init(device),
            generator: LinearConfig::new(self.dimensions, self.num_classes).init(device),
            padding_idx: self.padding_idx,
            sqrt_model_size: (self.dimensions as f64).sqrt(),
        }
    }
}

/// Image-to-token-sequence baseline: convolutional features collapsed over
/// the height, read by a transformer decoder.
#[derive(Module, Debug)]
pub struct Recognizer<B: Backend> {
    pub features: Vec<ConvBlock<B>>,
    pub embedding: Embedding<B>,
    pub position: PositionalEncoding<B>,
    pub decoder: TransformerDecoder<B>,
    pub generator: Linear<B>,
    padding_idx: usize,
    sqrt_model_size: f64,
}

impl<B: Backend> Recognizer<B> {
    /// `[batch, channels, height, width]` -> `[batch, steps, dimensions]`
    pub fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let mut x = images;
        for block in &self.features {
            x = block.forward(x);
        }

        let [batch, channels, _, width] = x.dims();
        let x = x.mean_dim(2).reshape([batch, channels, width]).swap_dims(1, 2);

        self.position.forward(x)
    }

    pub fn decode(&self, memory: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let device = memory.device();
        let targets = targets.to_device(&device);
        let [batch, length] = targets.dims();

        let mask_pad = targets.clone().equal_elem(self.padding_idx as i64);
        let mask_attn = generate_autoregressive_mask::<B>(batch, length, &device);
        let embedded = self
            .embedding
            .forward(targets)
            .mul_scalar(self.sqrt_model_size);
        let embedded = self.position.forward(embedded);

        let decoded = self.decoder.forward(
            TransformerDecoderInput::new(embedded, memory)
                .target_mask_pad(mask_pad)
                .target_mask_attn(mask_attn),
        );

        self.generator.forward(decoded)
    }

    pub fn forward(&self, images: Tensor<B, 4>, targets: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let memory = self.encode(images);
        self.decode(memory, targets)
    }

    /// Teacher forcing: the decoder reads `targets[.., ..T-1]` and is scored
    /// against `targets[.., 1..]`, ignoring padding.
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
    ) -> SequenceOutput<B> {
        let device = &self.devices()[0];
        let images = images.to_device(device);
        let targets = targets.to_device(device);

        let [batch, time_steps] = targets.dims();
        let target_right_shifted = targets.clone().slice([0..batch, 0..(time_steps - 1)]);
        let target_left_shifted = targets.slice([0..batch, 1..time_steps]);

        let output = self.forward(images, target_right_shifted);
        let num_classes = output.dims()[2] as i32;
        let output_reshape = output.reshape([-1, num_classes]);
        let target_reshape = target_left_shifted.reshape([-1]);
        let loss = CrossEntropyLoss::new(Some(self.padding_idx), device)
            .forward(output_reshape.clone(), target_reshape.clone());

        SequenceOutput {
            classification: ClassificationOutput::new(loss, output_reshape, target_reshape),
            batch_size: batch,
            pad_token: self.padding_idx,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<TextImgBatch<B>, SequenceOutput<B>> for Recognizer<B> {
    fn step(&self, batch: TextImgBatch<B>) -> TrainOutput<SequenceOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.classification.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<TextImgBatch<B>, SequenceOutput<B>> for Recognizer<B> {
    fn step(&self, batch: TextImgBatch<B>) -> SequenceOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
