//! Stochastic variational Bayes: evidence lower bound, natural
//! gradients of the Bayesian parameters and a standard optimizer for
//! the rest.

use crate::models::BayesianModel;
use crate::parameters::{AccumulatedStats, ParamId};
use candle_util::candle_core::Tensor;
use candle_util::candle_data_loader::DataLoader;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_util::candle_numeric::to_f64_scalar;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// ELBO of a (mini)batch along with the statistics needed to update
/// the posteriors
pub struct EvidenceLowerBound {
    /// `(N)` expected log-likelihood minus local KL, differentiable
    /// w.r.t. the non-Bayesian variables
    pub exp_llh_per_frame: Tensor,
    /// sum of `exp_llh_per_frame`
    pub exp_llh: f64,
    /// sum of the global `KL(posterior || prior)`
    pub kl_div: f64,
    pub local_kl_div: f64,
    /// `datasize / batch size`
    pub scale: f64,
    /// `scale * exp_llh - kl_div`
    pub value: f64,
    pub acc_stats: AccumulatedStats,
}

impl EvidenceLowerBound {
    /// * `data` - `(N, D)` raw data
    /// * `datasize` - size of the whole data set if `data` is a
    ///   minibatch
    pub fn evaluate<M: BayesianModel>(
        model: &M,
        data: &Tensor,
        datasize: Option<usize>,
    ) -> anyhow::Result<Self> {
        let stats = model.sufficient_statistics(data)?;
        let nn = stats.dim(0)?;
        if nn == 0 {
            crate::invalid_arg!("empty batch");
        }

        let (llh, state) = model.forward(&stats)?;
        let local_kl = model.local_kl_div_posterior_prior(&state)?;
        let exp_llh_per_frame = (&llh - local_kl.to_dtype(llh.dtype())?)?;
        let acc_stats = model.accumulate(&stats, state, None)?;

        let mut kl_div = 0.;
        for p in model.bayesian_parameters() {
            kl_div += to_f64_scalar(&p.kl_div()?)?;
        }

        let scale = datasize.map(|d| d as f64 / nn as f64).unwrap_or(1.);
        let exp_llh = to_f64_scalar(&exp_llh_per_frame.sum_all()?)?;
        let local_kl_div = to_f64_scalar(&local_kl.sum_all()?)?;

        Ok(Self {
            exp_llh_per_frame,
            exp_llh,
            kl_div,
            local_kl_div,
            scale,
            value: scale * exp_llh - kl_div,
            acc_stats,
        })
    }

    /// Scaled objective for the standard optimizer (the global KL is
    /// constant w.r.t. the non-Bayesian variables)
    pub fn objective(&self) -> anyhow::Result<Tensor> {
        Ok((self.exp_llh_per_frame.sum_all()? * self.scale)?)
    }

    /// Add `prior.η + scale * acc_stats - posterior.η` to the natural
    /// gradient of every Bayesian parameter
    pub fn backward_natural_grad<M: BayesianModel>(&self, model: &mut M) -> anyhow::Result<()> {
        for p in model.bayesian_parameters_mut() {
            let post = p.posterior().natural_hparams();
            let prior = p.prior().natural_hparams().to_device(post.device())?;
            let mut grad = (prior - post)?;
            if let Some(acc) = self.acc_stats.get(&p.id()) {
                let acc = acc.to_dtype(post.dtype())?.to_device(post.device())?;
                grad = (grad + (acc * self.scale)?)?;
            }
            p.add_natural_grad(&grad)?;
        }
        Ok(())
    }
}

/// Natural-gradient steps on the Bayesian parameters, one mean-field
/// group at a time, and AdamW on the non-Bayesian variables
pub struct BayesianModelOptimizer {
    learning_rate: f64,
    groups: Vec<Vec<ParamId>>,
    std_optimizer: Option<AdamW>,
}

impl BayesianModelOptimizer {
    /// Build the optimizer after any dtype or device conversion of
    /// `model`: conversions give the parameters new identities.
    pub fn new<M: BayesianModel>(
        model: &M,
        learning_rate: f64,
        std_learning_rate: f64,
    ) -> anyhow::Result<Self> {
        let vars = model.non_bayesian_variables()?;
        let std_optimizer = if vars.is_empty() {
            None
        } else {
            let params = ParamsAdamW {
                lr: std_learning_rate,
                ..Default::default()
            };
            Some(AdamW::new(vars, params)?)
        };
        Ok(Self {
            learning_rate,
            groups: model.mean_field_factorization(),
            std_optimizer,
        })
    }

    pub fn from_config<M: BayesianModel>(model: &M, config: &TrainConfig) -> anyhow::Result<Self> {
        Self::new(
            model,
            config.learning_rate as f64,
            config.std_learning_rate as f64,
        )
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn zero_grad<M: BayesianModel>(&self, model: &mut M) -> anyhow::Result<()> {
        for p in model.bayesian_parameters_mut() {
            p.zero_natural_grad()?;
        }
        Ok(())
    }

    /// One gradient step on the non-Bayesian variables (maximizing
    /// `elbo`), then `posterior.η += lr * natural_grad` group by group
    pub fn step<M: BayesianModel>(
        &mut self,
        model: &mut M,
        elbo: &EvidenceLowerBound,
    ) -> anyhow::Result<()> {
        if let Some(opt) = self.std_optimizer.as_mut() {
            let loss = elbo.objective()?.neg()?;
            opt.backward_step(&loss)?;
        }

        for group in &self.groups {
            for p in model.bayesian_parameters_mut() {
                if group.contains(&p.id()) {
                    p.natural_grad_step(self.learning_rate)?;
                }
            }
        }
        Ok(())
    }
}

/// Minibatch training; returns the ELBO per data point of every epoch
pub fn train<M, D>(
    model: &mut M,
    data: &mut D,
    optimizer: &mut BayesianModelOptimizer,
    config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    M: BayesianModel,
    D: DataLoader,
{
    let datasize = data.num_data();
    if datasize == 0 {
        crate::invalid_arg!("no data to train on");
    }

    let pb = ProgressBar::new(config.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut elbo_trace = vec![];

    for epoch in 0..config.num_epochs {
        data.shuffle_minibatch(config.batch_size)?;
        let num_minibatch = data.num_minibatch();

        let mut elbo_tot = 0f64;
        for b in 0..num_minibatch {
            let x = data.minibatch_data(b, &config.device)?;
            optimizer.zero_grad(model)?;
            let elbo = EvidenceLowerBound::evaluate(model, &x, Some(datasize))?;
            elbo.backward_natural_grad(model)?;
            optimizer.step(model, &elbo)?;
            elbo_tot += elbo.value;
        }

        elbo_trace.push((elbo_tot / (num_minibatch.max(1) * datasize) as f64) as f32);
        pb.inc(1);
        if config.verbose {
            info!(
                "[{}] ELBO: {}",
                epoch + 1,
                elbo_trace.last().ok_or(anyhow::anyhow!("elbo"))?
            );
        }
    }
    pb.finish_and_clear();
    Ok(elbo_trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use candle_util::candle_core::{DType, Device};

    fn normal() -> anyhow::Result<NormalDiagonalCovariance> {
        let dev = Device::Cpu;
        NormalDiagonalCovariance::create(
            &Tensor::zeros(2, DType::F64, &dev)?,
            &Tensor::ones(2, DType::F64, &dev)?,
            1.,
        )
    }

    #[test]
    fn elbo_scale_and_prior_gradient() -> anyhow::Result<()> {
        let mut model = normal()?;
        let x = Tensor::new(&[[1_f64, 2.], [0., -1.], [0.5, 0.5]], &Device::Cpu)?;

        let elbo = EvidenceLowerBound::evaluate(&model, &x, Some(12))?;
        approx::assert_abs_diff_eq!(elbo.scale, 4.0, epsilon = 1e-12);
        // posterior == prior at creation
        approx::assert_abs_diff_eq!(elbo.kl_div, 0.0, epsilon = 1e-8);
        approx::assert_abs_diff_eq!(elbo.value, 4. * elbo.exp_llh, epsilon = 1e-8);

        elbo.backward_natural_grad(&mut model)?;
        let grad = model.parameter().natural_grad().to_vec1::<f64>()?;
        let acc = elbo.acc_stats[&model.parameter().id()].to_vec1::<f64>()?;
        for (g, a) in grad.iter().zip(acc.iter()) {
            approx::assert_abs_diff_eq!(*g, 4. * a, epsilon = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn full_batch_step_reaches_the_posterior() -> anyhow::Result<()> {
        let mut model = normal()?;
        let x = Tensor::new(&[[1_f64, 2.], [0., -1.], [0.5, 0.5]], &Device::Cpu)?;
        let mut optimizer = BayesianModelOptimizer::new(&model, 1., 1e-3)?;

        let before = EvidenceLowerBound::evaluate(&model, &x, None)?.value;
        optimizer.zero_grad(&mut model)?;
        let elbo = EvidenceLowerBound::evaluate(&model, &x, None)?;
        elbo.backward_natural_grad(&mut model)?;
        optimizer.step(&mut model, &elbo)?;

        // a unit step lands on prior.η + acc
        let want = (model.parameter().prior().natural_hparams()
            + &elbo.acc_stats[&model.parameter().id()])?
            .to_vec1::<f64>()?;
        let got = model.parameter().posterior().natural_hparams().to_vec1::<f64>()?;
        for (g, w) in got.iter().zip(want.iter()) {
            approx::assert_abs_diff_eq!(*g, *w, epsilon = 1e-10);
        }

        let after = EvidenceLowerBound::evaluate(&model, &x, None)?.value;
        assert!(after > before);
        Ok(())
    }
}
