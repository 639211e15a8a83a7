use std::path::Path;

use candle_core::{bail, Module, ModuleT, Result, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::{block::ResidualBlock, config::AdversaryConfig, named_parameters, named_variables};

#[derive(Debug, Clone)]
pub struct AdversaryOutput {
    /// Sensitive-attribute logits shaped `(batch, num_classes)`.
    pub logits: Tensor,
    /// Pooled embedding the logits are computed from, shaped `(batch, hidden_channels)`.
    pub embedding: Tensor,
}

/// Contract for networks probing a sensitive attribute from backbone features.
pub trait Adversary {
    fn forward_t(&self, features: &Tensor, train: bool) -> Result<AdversaryOutput>;

    fn forward(&self, features: &Tensor) -> Result<AdversaryOutput> {
        self.forward_t(features, false)
    }
}

/// Residual stage plus linear head over the backbone's intermediate feature map.
pub struct AttributeAdversary {
    config: AdversaryConfig,
    varmap: VarMap,
    stage: ResidualBlock,
    head: Linear,
}

impl AttributeAdversary {
    pub const PREFIX: &'static str = "adversary";

    pub fn new(config: AdversaryConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device).pp(Self::PREFIX);

        let stage = ResidualBlock::new(config.in_channels, config.hidden_channels, 2, vb.pp("stage"))?;
        let head = linear(config.hidden_channels, config.num_classes, vb.pp("head"))?;

        Ok(Self {
            config,
            varmap,
            stage,
            head,
        })
    }

    pub fn config(&self) -> &AdversaryConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn parameters(&self) -> Vec<(String, Var)> {
        named_parameters(&self.varmap)
    }

    pub fn variables(&self) -> Vec<(String, Var)> {
        named_variables(&self.varmap)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)
    }
}

impl Adversary for AttributeAdversary {
    fn forward_t(&self, features: &Tensor, train: bool) -> Result<AdversaryOutput> {
        let dims = features.dims();
        if dims.len() != 4 || dims[1] != self.config.in_channels {
            bail!(
                "adversary expected [batch, {}, h, w] features, got {:?}",
                self.config.in_channels,
                dims
            );
        }
        let hidden = self.stage.forward_t(features, train)?;
        let embedding = hidden.mean((2, 3))?;
        let logits = self.head.forward(&embedding)?;
        Ok(AdversaryOutput { logits, embedding })
    }
}
