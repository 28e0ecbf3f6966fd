use approx::assert_abs_diff_eq;
use candle_util::candle_core::{DType, Device, Tensor};
use lentil::expfamily::*;
use lentil::ModelError;
use nalgebra::DMatrix;
use special::Gamma as _;

fn vec64(x: &Tensor) -> Vec<f64> {
    x.to_dtype(DType::F64)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f64>()
        .unwrap()
}

fn assert_all_close(got: &[f64], want: &[f64], eps: f64) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want.iter()) {
        assert_abs_diff_eq!(*g, *w, epsilon = eps);
    }
}

/// Central differences of the log-normalizer
fn finite_difference(prior: &ExpFamilyPrior) -> anyhow::Result<Vec<f64>> {
    let eta = vec64(prior.natural_hparams());
    let h = 1e-6;
    let mut ret = vec![];
    for i in 0..eta.len() {
        let mut up = eta.clone();
        let mut down = eta.clone();
        up[i] += h;
        down[i] -= h;
        let a_up = vec64(&prior.log_norm(&Tensor::new(up.as_slice(), &Device::Cpu)?)?)[0];
        let a_down = vec64(&prior.log_norm(&Tensor::new(down.as_slice(), &Device::Cpu)?)?)[0];
        ret.push((a_up - a_down) / (2. * h));
    }
    Ok(ret)
}

fn dirichlet() -> anyhow::Result<ExpFamilyPrior> {
    dirichlet_prior(&Tensor::new(&[1.5_f64, 2., 3.], &Device::Cpu)?)
}

fn gamma() -> anyhow::Result<ExpFamilyPrior> {
    gamma_prior(2.5, 1.5, DType::F64, &Device::Cpu)
}

fn normal_gamma() -> anyhow::Result<ExpFamilyPrior> {
    let dev = Device::Cpu;
    normal_gamma_prior(
        &Tensor::new(&[0.5_f64, -1.], &dev)?,
        &Tensor::new(&[2_f64, 0.5], &dev)?,
        3.,
    )
}

fn normal_wishart() -> anyhow::Result<ExpFamilyPrior> {
    let dev = Device::Cpu;
    normal_wishart_prior(
        &Tensor::new(&[0.3_f64, -0.2], &dev)?,
        &Tensor::new(&[[2_f64, 0.3], [0.3, 1.]], &dev)?,
        2.,
    )
}

fn all_families() -> anyhow::Result<Vec<ExpFamilyPrior>> {
    let dev = Device::Cpu;
    let mean = Tensor::new(&[0.3_f64, -0.2], &dev)?;
    let cov = Tensor::new(&[[2_f64, 0.3], [0.3, 1.]], &dev)?;
    let means = Tensor::new(&[[0.3_f64, -0.2], [1., 0.5], [-1., 2.]], &dev)?;
    let prec = Tensor::new(&[1_f64, 2.], &dev)?;
    let scalar = Tensor::new(&[1.5_f64], &dev)?;
    Ok(vec![
        dirichlet()?,
        gamma()?,
        normal_gamma()?,
        joint_normal_gamma_prior(&means, &prec, 2.)?,
        isotropic_normal_gamma_prior(&mean, &scalar, 2.)?,
        normal_wishart()?,
        joint_normal_wishart_prior(&means, &cov, 2.)?,
        normal_full_covariance_prior(&mean, &cov)?,
        normal_isotropic_covariance_prior(&mean, &scalar)?,
        matrix_normal_prior(&Tensor::new(&[[1_f64, 0., 2.], [0.5, -1., 0.]], &dev)?, &cov)?,
    ])
}

#[test]
fn dirichlet_expectations() -> anyhow::Result<()> {
    let prior = dirichlet()?;
    let alpha = [1.5_f64, 2., 3.];
    let total: f64 = alpha.iter().sum();
    let want = alpha
        .iter()
        .map(|a| a.digamma() - total.digamma())
        .collect::<Vec<_>>();
    let got = vec64(prior.expected_sufficient_statistics());
    assert_all_close(&got, &want, 1e-5);
    assert_all_close(&got, &finite_difference(&prior)?, 1e-5);
    Ok(())
}

#[test]
fn gamma_expectations() -> anyhow::Result<()> {
    let prior = gamma()?;
    let (shape, rate) = (2.5_f64, 1.5_f64);
    let want = [shape.digamma() - rate.ln(), shape / rate];
    let got = vec64(prior.expected_sufficient_statistics());
    assert_all_close(&got, &want, 1e-5);
    assert_all_close(&got, &finite_difference(&prior)?, 1e-5);
    Ok(())
}

#[test]
fn normal_gamma_expectations() -> anyhow::Result<()> {
    let prior = normal_gamma()?;
    let eta = vec64(prior.natural_hparams());
    let dim = 2;

    let mut want = vec![0.; 4 * dim];
    for d in 0..dim {
        let (np1, np2, np3, np4) = (eta[d], eta[dim + d], eta[2 * dim + d], eta[3 * dim + d]);
        let kappa = np3;
        let m = np2 / np3;
        let a = 0.5 * (np4 + 1.);
        let b = 0.5 * (np1 - np2 * np2 / np3);
        let lambda = a / b;
        want[d] = -0.5 * lambda;
        want[dim + d] = lambda * m;
        want[2 * dim + d] = -0.5 / kappa - 0.5 * lambda * m * m;
        want[3 * dim + d] = 0.5 * (a.digamma() - b.ln());
    }

    let got = vec64(prior.expected_sufficient_statistics());
    assert_all_close(&got, &want, 1e-5);
    assert_all_close(&got, &finite_difference(&prior)?, 1e-5);

    // the prior expects the precision it was built from
    assert_abs_diff_eq!(-2. * got[0], 2.0, epsilon = 1e-8);
    assert_abs_diff_eq!(-2. * got[1], 0.5, epsilon = 1e-8);
    Ok(())
}

#[test]
fn normal_wishart_expectations() -> anyhow::Result<()> {
    let prior = normal_wishart()?;
    let eta = vec64(prior.natural_hparams());
    let dim = 2;

    let np1 = DMatrix::from_row_slice(dim, dim, &eta[..dim * dim]);
    let np2 = nalgebra::DVector::from_row_slice(&eta[dim * dim..dim * dim + dim]);
    let kappa = eta[dim * dim + dim];
    let dof = eta[dim * dim + dim + 1] + dim as f64;

    let ss = &np1 - &np2 * np2.transpose() / kappa;
    let ss_inv = ss.clone().try_inverse().expect("invertible");
    let exp_prec = &ss_inv * dof;
    let m = &np2 / kappa;

    let mut want = vec![];
    want.extend((&exp_prec * -0.5).transpose().iter().cloned());
    want.extend((&exp_prec * &m).iter().cloned());
    want.push(-0.5 * dim as f64 / kappa - 0.5 * (m.transpose() * &exp_prec * &m)[(0, 0)]);
    let ln_det = (1..=dim)
        .map(|i| (0.5 * (dof + 1. - i as f64)).digamma())
        .sum::<f64>()
        + dim as f64 * 2_f64.ln()
        - ss.determinant().ln();
    want.push(0.5 * ln_det);

    let got = vec64(prior.expected_sufficient_statistics());
    assert_all_close(&got, &want, 1e-5);

    // a symmetric block, whatever the determinant routine does
    assert_abs_diff_eq!(got[1], got[2], epsilon = 1e-10);
    Ok(())
}

#[test]
fn kl_of_a_distribution_with_itself_is_zero() -> anyhow::Result<()> {
    for prior in all_families()? {
        let kl = vec64(&kl_div(&prior, &prior)?)[0];
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-8);
    }
    Ok(())
}

#[test]
fn kl_is_positive_between_different_members() -> anyhow::Result<()> {
    let prior = normal_gamma()?;
    let mut posterior = prior.clone();
    let shifted = (prior.natural_hparams() * 1.5)?;
    posterior.set_natural_hparams(shifted)?;
    let kl = vec64(&kl_div(&posterior, &prior)?)[0];
    assert!(kl > 0.);
    Ok(())
}

#[test]
fn split_and_concat_round_trip() -> anyhow::Result<()> {
    for prior in all_families()? {
        let eta = prior.natural_hparams();
        let blocks = prior.split_sufficient_statistics(eta)?;
        assert_all_close(&vec64(&blocks.concat()?), &vec64(eta), 0.);

        let ess = prior.expected_sufficient_statistics();
        let blocks = prior.split_sufficient_statistics(ess)?;
        assert_all_close(&vec64(&blocks.concat()?), &vec64(ess), 0.);
    }

    let prior = normal_wishart()?;
    match prior.split_sufficient_statistics(prior.natural_hparams())? {
        StatsBlocks::NormalWishart {
            prec,
            prec_mean,
            prec_mean_sq,
            ln_det_prec,
        } => {
            assert_eq!(prec.dims(), &[2, 2]);
            assert_eq!(prec_mean.dims(), &[2]);
            assert_eq!(prec_mean_sq.dims(), &[1]);
            assert_eq!(ln_det_prec.dims(), &[1]);
        }
        other => panic!("unexpected blocks {:?}", other),
    }
    Ok(())
}

#[test]
fn constructors_validate_their_arguments() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let mean = Tensor::new(&[0_f64, 0.], &dev)?;

    let not_square = Tensor::ones((2, 3), DType::F64, &dev)?;
    let three_d = Tensor::ones((2, 2, 2), DType::F64, &dev)?;
    let wrong_size = Tensor::eye(3, DType::F64, &dev)?;

    let errors = vec![
        normal_wishart_prior(&mean, &not_square, 1.).unwrap_err(),
        normal_wishart_prior(&mean, &three_d, 1.).unwrap_err(),
        normal_full_covariance_prior(&mean, &wrong_size).unwrap_err(),
        normal_gamma_prior(&mean, &Tensor::ones(3, DType::F64, &dev)?, 1.).unwrap_err(),
        gamma_prior(-1., 1., DType::F64, &dev).unwrap_err(),
        dirichlet_prior(&not_square).unwrap_err(),
    ];
    for err in errors {
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::InvalidArgument(_))
        ));
    }
    Ok(())
}
