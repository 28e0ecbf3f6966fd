mod cli_common;
mod run_fit_gmm;
mod run_fit_vae;
mod run_simulate;

use clap::{Parser, Subcommand};
use log::info;
use run_fit_gmm::*;
use run_fit_vae::*;
use run_simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Natural-gradient variational Bayes with conjugate priors\n\
		  Gaussian mixtures and variational auto-encoders with \n\
		  Bayesian latent priors, trained on TSV data."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Simulate data from a Gaussian mixture")]
    Simulate(SimulateArgs),

    #[command(
        about = "Fit a Bayesian Gaussian mixture",
        long_about = "Fit a Gaussian mixture with Dirichlet weights and \n\
		      NormalGamma (diagonal) or NormalWishart (full) components \n\
		      by stochastic natural-gradient variational Bayes."
    )]
    FitGmm(FitGmmArgs),

    #[command(
        about = "Fit a VAE with a Gaussian mixture latent prior",
        long_about = "Fit a variational auto-encoder whose latent space \n\
		      follows a Bayesian Gaussian mixture. Encoder and decoder \n\
		      are built from JSON block configurations."
    )]
    FitVae(FitVaeArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::FitGmm(args) => {
            run_fit_gmm(args)?;
        }
        Commands::FitVae(args) => {
            run_fit_vae(args)?;
        }
    }

    info!("Done");
    Ok(())
}
