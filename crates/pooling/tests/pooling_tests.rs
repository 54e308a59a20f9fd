use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use layers::Layer;
use pooling::{build_pooling, GemPooling, PoolingConfig, PoolingMethod};

fn half_norms(out: &Tensor, channels: usize) -> Result<Vec<f32>> {
    let mut norms = Vec::new();
    for start in [0, channels] {
        let half = out.narrow(D::Minus1, start, channels)?;
        norms.extend(half.sqr()?.sum(D::Minus1)?.sqrt()?.to_vec1::<f32>()?);
    }
    Ok(norms)
}

#[test]
fn max_mean_pooling_returns_unit_norm_halves() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let layer = build_pooling(&PoolingConfig::new(PoolingMethod::MaxMean), 4, vb.pp("pool"))?;
    assert_eq!(layer.id(), "pool");

    let input = Tensor::randn(0f32, 1.0, (2, 5, 4), &Device::Cpu)?;
    let out = layer.forward_t(&input, false)?;
    assert_eq!(out.dims(), &[2, 8]);
    for norm in half_norms(&out, 4)? {
        assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
    }
    Ok(())
}

#[test]
fn every_method_preserves_batch() -> Result<()> {
    let input = Tensor::rand(0.1f32, 2.0, (3, 6, 5), &Device::Cpu)?;
    for method in [
        PoolingMethod::Max,
        PoolingMethod::Mean,
        PoolingMethod::MaxMean,
        PoolingMethod::Gem,
    ] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = PoolingConfig::new(method);
        let layer = build_pooling(&config, 5, vb)?;
        let out = layer.forward_t(&input, true)?;
        assert_eq!(out.dims(), &[3, config.output_dim(5)], "{method:?}");
    }
    Ok(())
}

#[test]
fn optional_normalisation_applies_to_single_reductions() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = PoolingConfig::new(PoolingMethod::Max).with_l2_normalize(true);
    let layer = build_pooling(&config, 4, vb)?;
    let input = Tensor::randn(0f32, 3.0, (2, 7, 4), &Device::Cpu)?;
    let norms = layer
        .forward_t(&input, false)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?
        .to_vec1::<f32>()?;
    assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn gem_of_constant_frames_returns_the_constant() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let gem = GemPooling::new(3, 1e-6, 3.0, vb.pp("gem"))?;
    assert_eq!(gem.power().to_vec1::<f32>()?, vec![3.0]);

    let input = Tensor::full(0.7f32, (2, 4, 3), &Device::Cpu)?;
    let out = gem.forward_t(&input, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(out.iter().all(|v| (v - 0.7).abs() < 1e-4), "{out:?}");
    assert_eq!(varmap.all_vars().len(), 1);
    Ok(())
}

#[test]
fn gem_honours_l2_normalize() -> Result<()> {
    let input = Tensor::rand(1.0f32, 3.0, (2, 4, 8), &Device::Cpu)?;
    let row_norms = |l2: bool| -> Result<Vec<f32>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = PoolingConfig::new(PoolingMethod::Gem).with_l2_normalize(l2);
        let out = build_pooling(&config, 8, vb)?.forward_t(&input, false)?;
        Ok(out.sqr()?.sum(D::Minus1)?.sqrt()?.to_vec1::<f32>()?)
    };

    for norm in row_norms(true)? {
        assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
    }
    // Every pooled channel is at least 1, so the raw row norm is at least sqrt(8).
    assert!(row_norms(false)?.iter().all(|n| *n > 2.5));
    Ok(())
}

#[test]
fn gem_lies_between_mean_and_max() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let gem = GemPooling::new(1, 1e-6, 3.0, vb)?;
    let input = Tensor::from_vec(vec![1.0f32, 2.0, 4.0], (1, 3, 1), &Device::Cpu)?;
    let value = gem.forward_t(&input, false)?.flatten_all()?.to_vec1::<f32>()?[0];
    assert!(value > 7.0 / 3.0 && value < 4.0, "{value}");
    Ok(())
}

#[test]
fn rank_two_input_is_rejected() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    for method in [PoolingMethod::Mean, PoolingMethod::Gem] {
        let layer = build_pooling(&PoolingConfig::new(method), 4, vb.pp(format!("{method:?}")))?;
        let input = Tensor::zeros((2, 4), DType::F32, &Device::Cpu)?;
        assert!(layer.forward_t(&input, false).is_err());
    }
    Ok(())
}

#[test]
fn zero_frames_are_rejected() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let layer = build_pooling(&PoolingConfig::new(PoolingMethod::Max), 4, vb)?;
    let input = Tensor::zeros((2, 0, 4), DType::F32, &Device::Cpu)?;
    assert!(layer.forward_t(&input, false).is_err());
    Ok(())
}
