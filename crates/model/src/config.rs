use candle_core::{DType, Device, Error, Result};

/// Number of facial-expression classes predicted by the backbone head.
pub const EMOTION_CLASSES: usize = 7;

/// Configuration for the convolutional expression backbone.
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub in_channels: usize,
    pub stem_channels: usize,
    /// Channel width of the intermediate feature map handed to the adversary.
    pub feature_channels: usize,
    pub head_channels: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
}

impl BackboneConfig {
    pub fn new(device: Device) -> Self {
        Self {
            in_channels: 3,
            stem_channels: 32,
            feature_channels: 64,
            head_channels: 128,
            num_classes: EMOTION_CLASSES,
            dtype: DType::F32,
            device,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.stem_channels == 0 || self.feature_channels == 0 || self.head_channels == 0 {
            return Err(Error::Msg("channel widths must be greater than zero".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "backbone dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}

/// Configuration for the sensitive-attribute adversary.
#[derive(Debug, Clone)]
pub struct AdversaryConfig {
    /// Must match [`BackboneConfig::feature_channels`].
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
}

impl AdversaryConfig {
    pub fn for_backbone(backbone: &BackboneConfig, num_classes: usize) -> Self {
        Self {
            in_channels: backbone.feature_channels,
            hidden_channels: backbone.head_channels,
            num_classes,
            dtype: backbone.dtype,
            device: backbone.device.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.hidden_channels == 0 {
            return Err(Error::Msg("channel widths must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "adversary needs at least two classes (got {})",
                self.num_classes
            )));
        }
        Ok(())
    }
}
