use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_model_decoder::GaussianDecoder;
use candle_util::candle_model_encoder::{GaussianEncoder, GaussianModuleConfig};
use candle_util::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use candle_util::candle_nnet_registry::{BlockConfig, ElementRegistry};

fn config(dim_in: usize, dim_hidden: usize, dim_out: usize) -> GaussianModuleConfig {
    GaussianModuleConfig {
        dim_in,
        dim_hidden,
        dim_out,
        blocks: vec![BlockConfig {
            block_structure: vec![
                format!("Linear:in_features={};out_features={}", dim_in, dim_hidden),
                "Tanh".to_string(),
            ],
            residual: false,
        }],
    }
}

#[test]
fn gaussian_encoder_forward() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let registry = ElementRegistry::with_defaults();

    let enc = GaussianEncoder::new(&config(6, 8, 2), &registry, vb)?;
    assert_eq!(enc.dim_obs(), 6);
    assert_eq!(enc.dim_latent(), 2);

    let x = Tensor::randn(0_f32, 1., (10, 6), &dev)?;
    let (mean, var) = enc.forward_t(&x, true)?;
    assert_eq!(mean.dims(), &[10, 2]);
    assert_eq!(var.dims(), &[10, 2]);

    let min_var = var.min_all()?.to_scalar::<f32>()?;
    assert!(min_var >= (-8_f32).exp() * 0.999);

    let z = enc.reparameterize(&mean, &var, false)?;
    assert_eq!(
        z.to_vec2::<f32>()?,
        mean.to_vec2::<f32>()?,
        "no noise outside of training"
    );

    let names = varmap.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
    assert!(names.iter().any(|x| x == "nn.enc.z.mean.weight"));
    assert!(names.iter().any(|x| x == "nn.enc.fc.block.0.0.weight"));
    Ok(())
}

#[test]
fn gaussian_decoder_forward() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let registry = ElementRegistry::with_defaults();

    let dec = GaussianDecoder::new(&config(2, 8, 6), true, &registry, vb.clone())?;
    assert!(dec.has_variance());
    assert_eq!(dec.dim_latent(), 2);
    assert_eq!(dec.dim_obs(), 6);

    let z = Tensor::randn(0_f32, 1., (4, 2), &dev)?;
    let (mean, var) = dec.forward_with_variance(&z)?;
    assert_eq!(mean.dims(), &[4, 6]);
    assert_eq!(var.dims(), &[4, 6]);
    assert_eq!(dec.forward(&z)?.to_vec2::<f32>()?, mean.to_vec2::<f32>()?);

    let varmap2 = VarMap::new();
    let vb2 = VarBuilder::from_varmap(&varmap2, DType::F32, &dev);
    let dec_mean_only = GaussianDecoder::new(&config(2, 8, 6), false, &registry, vb2)?;
    assert!(dec_mean_only.forward_with_variance(&z).is_err());
    assert_eq!(dec_mean_only.forward(&z)?.dims(), &[4, 6]);
    Ok(())
}

#[test]
fn gaussian_module_config_from_json() -> anyhow::Result<()> {
    let conf: GaussianModuleConfig = serde_json::from_str(
        r#"{
            "dim_in": 3, "dim_hidden": 5, "dim_out": 2,
            "blocks": [{"block_structure": ["Linear:in_features=3;out_features=5", "ReLU"]}]
        }"#,
    )?;
    assert_eq!(conf, config_relu());
    Ok(())
}

fn config_relu() -> GaussianModuleConfig {
    GaussianModuleConfig {
        dim_in: 3,
        dim_hidden: 5,
        dim_out: 2,
        blocks: vec![BlockConfig {
            block_structure: vec![
                "Linear:in_features=3;out_features=5".to_string(),
                "ReLU".to_string(),
            ],
            residual: false,
        }],
    }
}
