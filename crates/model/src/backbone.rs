use std::path::Path;

use candle_core::{bail, Module, ModuleT, Result, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, linear, ops, BatchNorm, Conv2d, Conv2dConfig, Linear,
    VarBuilder, VarMap,
};

use crate::{block::ResidualBlock, config::BackboneConfig, named_parameters, named_variables};

/// Tensors produced by one backbone forward pass.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// Emotion logits shaped `(batch, num_classes)`.
    pub logits: Tensor,
    /// Spatial attention weights in `[0, 1]` shaped `(batch, 1, h, w)`.
    pub attention: Tensor,
    /// Intermediate feature map shaped `(batch, feature_channels, H/4, W/4)`.
    pub features: Tensor,
}

/// Contract every expression backbone exposes to the training loop.
pub trait Backbone {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<BackboneOutput>;

    /// Eval-mode forward pass.
    fn forward(&self, images: &Tensor) -> Result<BackboneOutput> {
        self.forward_t(images, false)
    }
}

/// Residual convolutional backbone with a spatial attention head.
pub struct ExpressionBackbone {
    config: BackboneConfig,
    varmap: VarMap,
    stem: Conv2d,
    stem_bn: BatchNorm,
    feature_stage: ResidualBlock,
    head_stage: ResidualBlock,
    attention: Conv2d,
    classifier: Linear,
}

impl ExpressionBackbone {
    pub const PREFIX: &'static str = "backbone";

    pub fn new(config: BackboneConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device).pp(Self::PREFIX);

        let stem = conv2d_no_bias(
            config.in_channels,
            config.stem_channels,
            3,
            Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            },
            vb.pp("stem.conv"),
        )?;
        let stem_bn = batch_norm(config.stem_channels, 1e-5, vb.pp("stem.bn"))?;
        let feature_stage = ResidualBlock::new(
            config.stem_channels,
            config.feature_channels,
            2,
            vb.pp("feature_stage"),
        )?;
        let head_stage = ResidualBlock::new(
            config.feature_channels,
            config.head_channels,
            2,
            vb.pp("head_stage"),
        )?;
        let attention = conv2d(
            config.head_channels,
            1,
            1,
            Conv2dConfig::default(),
            vb.pp("attention"),
        )?;
        let classifier = linear(config.head_channels, config.num_classes, vb.pp("classifier"))?;

        Ok(Self {
            config,
            varmap,
            stem,
            stem_bn,
            feature_stage,
            head_stage,
            attention,
            classifier,
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Learnable parameters, sorted by name. Batch-norm buffers are excluded.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        named_parameters(&self.varmap)
    }

    /// Parameters and batch-norm buffers, sorted by name.
    pub fn variables(&self) -> Vec<(String, Var)> {
        named_variables(&self.varmap)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)
    }
}

impl Backbone for ExpressionBackbone {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<BackboneOutput> {
        let dims = images.dims();
        if dims.len() != 4 || dims[1] != self.config.in_channels {
            bail!(
                "backbone expected [batch, {}, height, width] images, got {:?}",
                self.config.in_channels,
                dims
            );
        }

        let stem = self
            .stem
            .forward(images)?
            .apply_t(&self.stem_bn, train)?
            .relu()?;
        let features = self.feature_stage.forward_t(&stem, train)?;
        let head = self.head_stage.forward_t(&features, train)?;

        let attention = ops::sigmoid(&self.attention.forward(&head)?)?;
        let attended = head.broadcast_mul(&attention)?;
        let pooled = attended.mean((2, 3))?;
        let logits = self.classifier.forward(&pooled)?;

        Ok(BackboneOutput {
            logits,
            attention,
            features,
        })
    }
}
