use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

const BN_EPS: f64 = 1e-5;

/// Basic two-convolution residual block with an optional projection shortcut.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<(Conv2d, BatchNorm)>,
}

impl ResidualBlock {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d_no_bias(
            in_channels,
            out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let bn1 = batch_norm(out_channels, BN_EPS, vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(
            out_channels,
            out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let bn2 = batch_norm(out_channels, BN_EPS, vb.pp("bn2"))?;

        let shortcut = if stride != 1 || in_channels != out_channels {
            let conv = conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("shortcut.conv"),
            )?;
            let bn = batch_norm(out_channels, BN_EPS, vb.pp("shortcut.bn"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
        })
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let residual = match &self.shortcut {
            Some((conv, bn)) => conv.forward(xs)?.apply_t(bn, train)?,
            None => xs.clone(),
        };
        let out = self.conv1.forward(xs)?.apply_t(&self.bn1, train)?.relu()?;
        let out = self.conv2.forward(&out)?.apply_t(&self.bn2, train)?;
        (out + residual)?.relu()
    }
}
