use anyhow::Result;
use attention::{AttentionConfig, AttentionError, MultiHeadAttention};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use layers::{norm::NormSettings, Layer, LayerError};

fn build(config: AttentionConfig) -> Result<(VarMap, MultiHeadAttention)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let attention = MultiHeadAttention::new(config, &NormSettings::default(), vb.pp("attention"))?;
    Ok((varmap, attention))
}

#[test]
fn output_shape_is_independent_of_head_count() -> Result<()> {
    let input = Tensor::randn(0f32, 1.0, (2, 6, 12), &Device::Cpu)?;
    for heads in [1usize, 2, 3, 4, 6, 12] {
        let (_, attention) = build(AttentionConfig::new(12, 24, heads))?;
        let out = attention.forward_t(&input, false)?;
        assert_eq!(out.dims(), &[2, 6, 12], "heads={heads}");
    }
    Ok(())
}

#[test]
fn identical_frames_receive_uniform_weights() -> Result<()> {
    let (_, attention) = build(AttentionConfig::new(8, 8, 1))?;
    let frame = Tensor::randn(0f32, 1.0, (1, 1, 8), &Device::Cpu)?;
    let input = Tensor::cat(&[&frame, &frame, &frame], 1)?;

    let weights = attention
        .attention_weights(&input, &input, false)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert_eq!(weights.len(), 9);
    for w in weights {
        assert!((w - 1.0 / 3.0).abs() < 1e-5, "weight {w}");
    }

    let out = attention.forward_t(&input, false)?;
    let first = out.narrow(1, 0, 1)?;
    let spread = out
        .broadcast_sub(&first)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(spread < 1e-5);

    // Uniform weights over equal values return that value unchanged.
    let mixed = attention.attend(&input, &input, false)?;
    let expected = attention.project_values(&frame)?;
    assert_eq!(mixed.dims(), &[1, 3, 8]);
    let error = mixed
        .broadcast_sub(&expected)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(error < 1e-5, "mix differs from projected frame by {error}");
    Ok(())
}

#[test]
fn dropout_only_changes_training_outputs() -> Result<()> {
    let (_, attention) = build(AttentionConfig::new(8, 8, 2).with_dropout(0.5))?;
    let input = Tensor::randn(0f32, 1.0, (2, 16, 8), &Device::Cpu)?;
    let eval_a = attention.forward_t(&input, false)?;
    let eval_b = attention.forward_t(&input, false)?;
    let eval_diff = eval_a.sub(&eval_b)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert_eq!(eval_diff, 0.0);

    let train = attention.forward_t(&input, true)?;
    let train_diff = train.sub(&eval_a)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(train_diff > 0.0);
    Ok(())
}

#[test]
fn repeated_blocks_do_not_share_parameters() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = AttentionConfig::new(4, 4, 2);
    let first = MultiHeadAttention::new(config.clone(), &NormSettings::default(), vb.pp("block0"))?;
    let second = MultiHeadAttention::new(config, &NormSettings::default(), vb.pp("block1"))?;
    assert_eq!(first.id(), "block0");
    assert_eq!(second.id(), "block1");
    // q, k, v weights and output weight + bias for each block
    assert_eq!(varmap.all_vars().len(), 2 * 5);
    Ok(())
}

#[test]
fn invalid_config_converts_to_layer_error() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let err = MultiHeadAttention::new(AttentionConfig::new(8, 10, 4), &NormSettings::default(), vb)
        .unwrap_err();
    assert!(matches!(err, AttentionError::InvalidConfig { field: "hidden_size", .. }));
    let layer_err: LayerError = err.into();
    assert!(matches!(layer_err, LayerError::InvalidHyperparameter { .. }));
}

#[test]
fn weights_respect_softmax_over_keys() -> Result<()> {
    let (_, attention) = build(AttentionConfig::new(4, 8, 2))?;
    let queries = Tensor::randn(0f32, 1.0, (3, 2, 4), &Device::Cpu)?;
    let keys = Tensor::randn(0f32, 1.0, (3, 9, 4), &Device::Cpu)?;
    let weights = attention.attention_weights(&queries, &keys, false)?;
    assert_eq!(weights.dims(), &[3, 2, 2, 9]);
    let min = weights.flatten_all()?.min(0)?.to_vec0::<f32>()?;
    assert!(min >= 0.0);
    let sums = weights.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}
