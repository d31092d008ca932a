use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

pub fn convolution<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    bias: bool,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], kernel_size)
        .with_stride(stride)
        .with_padding(burn::nn::PaddingConfig2d::Explicit(padding[0], padding[1]))
        .with_bias(bias)
        .with_initializer(burn::nn::Initializer::KaimingNormal {
            gain: 2f64.sqrt(), // recommended gain value for relu
            fan_out_only: true,
        })
        .init(device)
}

pub fn max_pool_2d(kernel_size: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> MaxPool2d {
    MaxPool2dConfig::new(kernel_size)
        .with_strides(stride)
        .with_padding(burn::nn::PaddingConfig2d::Explicit(padding[0], padding[1]))
        .init()
}

/// 3x3 convolution, batch norm, relu and an optional max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        stride: [usize; 2],
        pool: Option<MaxPool2d>,
    ) -> Self {
        Self {
            conv: convolution(device, in_channels, out_channels, [3, 3], stride, [1, 1], false),
            norm: BatchNormConfig::new(out_channels).init(device),
            activation: Relu::new(),
            pool,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        let out = self.norm.forward(out);
        let out = self.activation.forward(out);

        match &self.pool {
            Some(pool) => pool.forward(out),
            None => out,
        }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    #[test]
    fn test_conv_block_shapes() {
        let device = NdArrayDevice::Cpu;
        let input = Tensor::<NdArray, 4>::zeros([2, 3, 32, 100], &device);

        let block = ConvBlock::<NdArray>::new(&device, 3, 8, [1, 1], None);
        assert_eq!(block.forward(input.clone()).dims(), [2, 8, 32, 100]);

        let block = ConvBlock::<NdArray>::new(&device, 3, 8, [2, 2], None);
        assert_eq!(block.forward(input.clone()).dims(), [2, 8, 16, 50]);

        let pool = max_pool_2d([2, 1], [2, 1], [0, 0]);
        let pooled = ConvBlock::<NdArray>::new(&device, 3, 8, [1, 1], Some(pool));
        assert_eq!(pooled.forward(input).dims(), [2, 8, 16, 100]);
    }
}
