use crate::cli_common::*;
use candle_util::candle_core::{DType, Tensor};
use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_encoder::GaussianModuleConfig;
use candle_util::candle_nnet_registry::{BlockConfig, ElementRegistry};
use clap::{Args, ValueEnum};
use lentil::models::*;
use lentil::training::{train, BayesianModelOptimizer};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum NoiseType {
    /// the decoder outputs a variance per observation
    Decoder,
    /// a global diagonal covariance
    Diagonal,
    /// a global isotropic covariance
    Isotropic,
}

#[derive(Args, Debug)]
pub struct FitVaeArgs {
    /// Data file (TSV, one sample per line, no header)
    #[arg(required = true)]
    data_file: Box<str>,

    /// Encoder configuration (JSON `GaussianModuleConfig`); a
    /// one-layer network if not given
    #[arg(long)]
    encoder_config: Option<Box<str>>,

    /// Decoder configuration (JSON `GaussianModuleConfig`); a
    /// one-layer network if not given
    #[arg(long)]
    decoder_config: Option<Box<str>>,

    /// latent dimension (ignored with JSON configurations)
    #[arg(long, short = 'l', default_value_t = 2)]
    n_latent: usize,

    /// hidden units of the default networks
    #[arg(long, default_value_t = 64)]
    n_hidden: usize,

    /// number of components of the latent Gaussian mixture
    #[arg(long, short = 'k', default_value_t = 5)]
    n_components: usize,

    #[arg(long, value_enum, default_value = "decoder")]
    noise: NoiseType,

    /// Monte Carlo samples per data point
    #[arg(long, default_value_t = 1)]
    nsamples: usize,

    #[arg(long, short = 'i', default_value_t = 100)]
    epochs: usize,

    #[arg(long, short = 'b', default_value_t = 100)]
    batch_size: usize,

    /// natural gradient step size
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f32,

    /// AdamW step size of the encoder and decoder
    #[arg(long, default_value_t = 1e-3)]
    std_learning_rate: f32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0)]
    device_no: usize,

    /// Output header: `{out}.latent.tsv`, `{out}.elbo.tsv`
    #[arg(long, short, required = true)]
    out: Box<str>,

    #[arg(long, short)]
    verbose: bool,
}

fn default_config(dim_in: usize, dim_hidden: usize, dim_out: usize) -> GaussianModuleConfig {
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

pub fn run_fit_vae(args: &FitVaeArgs) -> anyhow::Result<()> {
    let device = args.device.to_device(args.device_no)?;
    let dtype = DType::F32;
    let x = read_data(&args.data_file)?;
    let dim_obs = x.ncols();
    info!("data: {} x {}", x.nrows(), dim_obs);

    let encoder_config = match args.encoder_config.as_deref() {
        Some(file) => GaussianModuleConfig::from_json_file(file)?,
        None => default_config(dim_obs, args.n_hidden, args.n_latent),
    };
    let decoder_config = match args.decoder_config.as_deref() {
        Some(file) => GaussianModuleConfig::from_json_file(file)?,
        None => default_config(encoder_config.dim_out, args.n_hidden, dim_obs),
    };
    let dim_latent = encoder_config.dim_out;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let latent_set = NormalDiagonalCovarianceSet::create(
        &Tensor::zeros(dim_latent, dtype, &device)?,
        &Tensor::ones(dim_latent, dtype, &device)?,
        args.n_components,
        1.,
        1.,
        &mut rng,
    )?;
    let weights = (Tensor::ones(args.n_components, dtype, &device)? / args.n_components as f64)?;
    let latent = Mixture::create(latent_set, &weights, 1.)?;

    let noise = match args.noise {
        NoiseType::Decoder => ObservationNoise::Decoder,
        NoiseType::Diagonal => ObservationNoise::GlobalDiagonal(NormalDiagonalCovariance::create(
            &Tensor::zeros(dim_obs, dtype, &device)?,
            &Tensor::ones(dim_obs, dtype, &device)?,
            1.,
        )?),
        NoiseType::Isotropic => {
            ObservationNoise::GlobalIsotropic(NormalIsotropicCovariance::create(
                &Tensor::zeros(dim_obs, dtype, &device)?,
                &Tensor::ones(1, dtype, &device)?,
                1.,
            )?)
        }
    };

    let mut vae = Vae::new(
        encoder_config,
        decoder_config,
        Arc::new(ElementRegistry::with_defaults()),
        latent,
        noise,
        dtype,
        &device,
    )?
    .with_nsamples(args.nsamples);

    let mut data = InMemoryData::from_dmatrix(&x, dtype, &device)?.with_seed(args.seed);
    let config = TrainConfig {
        learning_rate: args.learning_rate,
        std_learning_rate: args.std_learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
    };
    let mut optimizer = BayesianModelOptimizer::from_config(&vae, &config)?;
    let trace = train(&mut vae, &mut data, &mut optimizer, &config)?;
    if let Some(last) = trace.last() {
        info!("final ELBO per data point: {}", last);
    }

    let full = candle_util::candle_numeric::dmatrix_to_tensor(&x, dtype, &device)?;
    let (latent_means, _) = vae.encode(&full)?;
    write_tensor(&latent_means, &args.out, "latent")?;
    write_tensor(
        &vae.latent_model().expected_weights()?.unsqueeze(1)?,
        &args.out,
        "latent_weights",
    )?;
    write_trace(&trace, &args.out)?;
    Ok(())
}
