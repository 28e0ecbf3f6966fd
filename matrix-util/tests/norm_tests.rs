use approx::assert_abs_diff_eq;
use matrix_util::traits::SymMatOps;
use matrix_util::utils::{generate_minibatch_intervals, shuffled_indices};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

fn rnorm_seeded(nrows: usize, ncols: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    DMatrix::from_fn(nrows, ncols, |_, _| rng.sample::<f64, _>(StandardNormal))
}

#[test]
fn symmetrize_test() {
    let xx = rnorm_seeded(5, 5, 1);
    let yy = xx.symmetrize();
    assert_abs_diff_eq!(yy.clone(), yy.transpose(), epsilon = 1e-14);
    assert_abs_diff_eq!((&xx + xx.transpose()) * 0.5, yy, epsilon = 1e-14);
}

#[test]
fn make_symposdef_test() -> anyhow::Result<()> {
    // eigenvalues 3, 1, -2 on a random orthogonal basis
    let qq = rnorm_seeded(3, 3, 42).qr().q();
    let dd = DMatrix::<f64>::from_diagonal(&nalgebra::DVector::from_vec(vec![3.0, 1.0, -2.0]));
    let xx = &qq * dd * qq.transpose();

    let threshold = 1e-3;
    let yy = xx.make_symposdef(threshold)?;
    let eig = yy.clone().symmetric_eigen();

    let min_eval = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    assert!(min_eval >= threshold - 1e-10);

    // eigen pairs above the threshold are kept
    for (k, lambda) in [(0, 3.0), (1, 1.0)] {
        let v = qq.column(k);
        assert_abs_diff_eq!(&yy * v, v * lambda, epsilon = 1e-10);
    }

    // the clamped direction sits at the threshold
    let v = qq.column(2);
    assert_abs_diff_eq!(&yy * v, v * threshold, epsilon = 1e-10);

    assert!(DMatrix::<f64>::zeros(2, 3).make_symposdef(threshold).is_err());
    Ok(())
}

#[test]
fn logdet_inverse_test() -> anyhow::Result<()> {
    let aa = DMatrix::<f64>::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
    assert_abs_diff_eq!(aa.logdet_spd()?, (1.75_f64).ln(), epsilon = 1e-12);

    let inv = aa.inverse_checked()?;
    assert_abs_diff_eq!(&aa * inv, DMatrix::identity(2, 2), epsilon = 1e-12);

    let neg = DMatrix::<f64>::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, 1.0]);
    assert!(neg.logdet_spd().is_err());
    Ok(())
}

#[test]
fn minibatch_test() {
    let intervals = generate_minibatch_intervals(25, 10);
    assert_eq!(intervals, vec![(0, 10), (10, 20), (20, 25)]);

    let mut idx = shuffled_indices(25, Some(7));
    assert_eq!(idx, shuffled_indices(25, Some(7)));
    idx.sort();
    assert_eq!(idx, (0..25).collect::<Vec<_>>());
}
