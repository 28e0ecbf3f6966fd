use crate::cli_common::*;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_inference::TrainConfig;
use clap::{Args, ValueEnum};
use lentil::models::*;
use lentil::training::{train, BayesianModelOptimizer};
use log::info;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
pub enum CovarianceType {
    /// one diagonal covariance per component
    Diagonal,
    /// one full covariance per component
    Full,
    /// a diagonal covariance shared by all components
    SharedDiagonal,
    /// a full covariance shared by all components
    SharedFull,
}

#[derive(Args, Debug)]
pub struct FitGmmArgs {
    /// Data file (TSV, one sample per line, no header)
    #[arg(required = true)]
    data_file: Box<str>,

    /// number of mixture components
    #[arg(long, short = 'k', default_value_t = 3)]
    n_components: usize,

    #[arg(long, value_enum, default_value = "diagonal")]
    covariance: CovarianceType,

    /// strength of the priors
    #[arg(long, default_value_t = 1.0)]
    pseudo_counts: f64,

    /// spread of the initial component means (in data standard
    /// deviations)
    #[arg(long, default_value_t = 1.0)]
    init_noise_std: f64,

    #[arg(long, short = 'i', default_value_t = 100)]
    epochs: usize,

    #[arg(long, short = 'b', default_value_t = 100)]
    batch_size: usize,

    /// natural gradient step size
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0)]
    device_no: usize,

    /// Output header: `{out}.weights.tsv`, `{out}.means.tsv`,
    /// `{out}.resps.tsv`, `{out}.elbo.tsv`
    #[arg(long, short, required = true)]
    out: Box<str>,

    #[arg(long, short)]
    verbose: bool,
}

pub fn run_fit_gmm(args: &FitGmmArgs) -> anyhow::Result<()> {
    let device = args.device.to_device(args.device_no)?;
    let x = read_data(&args.data_file)?;
    info!("data: {} x {}", x.nrows(), x.ncols());

    let (mean, var) = column_moments(&x, DType::F64, &device)?;
    let dd = x.ncols();
    let cov = Tensor::eye(dd, DType::F64, &device)?.broadcast_mul(&var.unsqueeze(0)?)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let (k, pc, noise) = (args.n_components, args.pseudo_counts, args.init_noise_std);

    match args.covariance {
        CovarianceType::Diagonal => {
            let set = NormalDiagonalCovarianceSet::create(&mean, &var, k, pc, noise, &mut rng)?;
            fit_mixture(set, &x, &device, args, |m, i| m.component(i))
        }
        CovarianceType::Full => {
            let set = NormalFullCovarianceSet::create(&mean, &cov, k, pc, noise, &mut rng)?;
            fit_mixture(set, &x, &device, args, |m, i| m.component(i))
        }
        CovarianceType::SharedDiagonal => {
            let set =
                NormalSetSharedDiagonalCovariance::create(&mean, &var, k, pc, noise, &mut rng)?;
            fit_mixture(set, &x, &device, args, |m, i| m.component(i))
        }
        CovarianceType::SharedFull => {
            let set = NormalSetSharedFullCovariance::create(&mean, &cov, k, pc, noise, &mut rng)?;
            fit_mixture(set, &x, &device, args, |m, i| m.component(i))
        }
    }
}

fn fit_mixture<M, F>(
    modelset: M,
    x: &DMatrix<f64>,
    device: &Device,
    args: &FitGmmArgs,
    view: F,
) -> anyhow::Result<()>
where
    M: BayesianModelSet,
    F: Fn(&Mixture<M>, usize) -> anyhow::Result<NormalView>,
{
    let kk = args.n_components;
    let weights = (Tensor::ones(kk, DType::F64, device)? / kk as f64)?;
    let mut model = Mixture::create(modelset, &weights, args.pseudo_counts)?;

    let mut data = InMemoryData::from_dmatrix(x, DType::F64, device)?.with_seed(args.seed);
    let config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        ..Default::default()
    };
    let mut optimizer = BayesianModelOptimizer::from_config(&model, &config)?;
    let trace = train(&mut model, &mut data, &mut optimizer, &config)?;
    if let Some(last) = trace.last() {
        info!("final ELBO per data point: {}", last);
    }

    let means = (0..kk)
        .map(|i| Ok(view(&model, i)?.mean))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let full = candle_util::candle_numeric::dmatrix_to_tensor(x, DType::F64, device)?;
    let (_, state) = model.forward(&model.sufficient_statistics(&full)?)?;

    write_tensor(&model.expected_weights()?.unsqueeze(1)?, &args.out, "weights")?;
    write_tensor(&Tensor::stack(&means, 0)?, &args.out, "means")?;
    write_tensor(&state.resps, &args.out, "resps")?;
    write_trace(&trace, &args.out)?;
    Ok(())
}
