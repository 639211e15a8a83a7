use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    is_buffer, Adversary, AdversaryConfig, AttributeAdversary, Backbone, BackboneConfig,
    ExpressionBackbone,
};

fn small_config() -> BackboneConfig {
    BackboneConfig {
        in_channels: 3,
        stem_channels: 4,
        feature_channels: 8,
        head_channels: 8,
        num_classes: 7,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, 16, 16), &Device::Cpu)?)
}

#[test]
fn backbone_exposes_logits_attention_and_features() -> Result<()> {
    let backbone = ExpressionBackbone::new(small_config())?;
    let out = backbone.forward(&images(2)?)?;

    assert_eq!(out.logits.dims(), &[2, 7]);
    assert_eq!(out.features.dims(), &[2, 8, 4, 4]);
    assert_eq!(out.attention.dims(), &[2, 1, 2, 2]);

    let weights = out.attention.flatten_all()?.to_vec1::<f32>()?;
    assert!(weights.iter().all(|w| (0.0..=1.0).contains(w)));
    Ok(())
}

#[test]
fn eval_forward_is_deterministic() -> Result<()> {
    let backbone = ExpressionBackbone::new(small_config())?;
    let input = images(3)?;

    let first = backbone.forward(&input)?.logits.to_vec2::<f32>()?;
    let second = backbone.forward(&input)?.logits.to_vec2::<f32>()?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn adversary_consumes_backbone_features() -> Result<()> {
    let config = small_config();
    let backbone = ExpressionBackbone::new(config.clone())?;
    let adversary = AttributeAdversary::new(AdversaryConfig::for_backbone(&config, 2))?;

    let features = backbone.forward(&images(2)?)?.features;
    let out = adversary.forward_t(&features, true)?;

    assert_eq!(out.logits.dims(), &[2, 2]);
    assert_eq!(out.embedding.dims(), &[2, 8]);
    Ok(())
}

#[test]
fn parameter_names_are_prefixed_and_exclude_buffers() -> Result<()> {
    let config = small_config();
    let backbone = ExpressionBackbone::new(config.clone())?;
    let adversary = AttributeAdversary::new(AdversaryConfig::for_backbone(&config, 5))?;

    let backbone_params = backbone.parameters();
    assert!(!backbone_params.is_empty());
    assert!(backbone_params
        .iter()
        .all(|(name, _)| name.starts_with("backbone.") && !is_buffer(name)));
    assert!(backbone.variables().len() > backbone_params.len());

    assert!(adversary
        .parameters()
        .iter()
        .all(|(name, _)| name.starts_with("adversary.")));
    Ok(())
}

#[test]
fn rejects_wrong_channel_count() -> Result<()> {
    let backbone = ExpressionBackbone::new(small_config())?;
    let grayscale = Tensor::zeros((1, 1, 16, 16), DType::F32, &Device::Cpu)?;
    assert!(backbone.forward(&grayscale).is_err());
    Ok(())
}

#[test]
fn adversary_requires_two_classes() {
    let config = small_config();
    assert!(AttributeAdversary::new(AdversaryConfig::for_backbone(&config, 1)).is_err());
}
