use clap::Args;
use log::info;
use matrix_util::common_io::{mkdir, write_types};
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// number of data points
    #[arg(long, short = 'n', default_value_t = 1000)]
    n_samples: usize,

    /// data dimension
    #[arg(long, short = 'd', default_value_t = 2)]
    dim: usize,

    /// number of mixture components
    #[arg(long, short = 'k', default_value_t = 3)]
    n_components: usize,

    /// standard deviation of the component means around zero
    #[arg(long, default_value_t = 5.0)]
    separation: f64,

    /// within-component standard deviation
    #[arg(long, default_value_t = 1.0)]
    noise_std: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output header: `{out}.data.tsv`, `{out}.labels.tsv`,
    /// `{out}.means.tsv`
    #[arg(long, short, required = true)]
    out: Box<str>,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.n_components == 0 || args.dim == 0 {
        return Err(anyhow::anyhow!("need at least one component and one dimension"));
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let between = Normal::new(0., args.separation)?;
    let within = Normal::new(0., args.noise_std)?;

    let means = DMatrix::<f64>::from_fn(args.n_components, args.dim, |_, _| {
        between.sample(&mut rng)
    });

    let mut labels = Vec::with_capacity(args.n_samples);
    let mut data = DMatrix::<f64>::zeros(args.n_samples, args.dim);
    for i in 0..args.n_samples {
        let k = rng.random_range(0..args.n_components);
        for j in 0..args.dim {
            data[(i, j)] = means[(k, j)] + within.sample(&mut rng);
        }
        labels.push(k);
    }

    let data_file = format!("{}.data.tsv", args.out);
    mkdir(&data_file)?;
    data.to_tsv(&data_file)?;
    write_types(&labels, &format!("{}.labels.tsv", args.out))?;
    means.to_tsv(&format!("{}.means.tsv", args.out))?;

    info!(
        "simulated {} x {} data from {} components: {}",
        args.n_samples, args.dim, args.n_components, data_file
    );
    Ok(())
}
