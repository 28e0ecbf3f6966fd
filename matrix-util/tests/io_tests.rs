use matrix_util::traits::IoOps;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn dmatrix_io_test() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let xx = DMatrix::<f64>::from_fn(50, 7, |_, _| rng.random::<f64>());

    let dir = tempfile::tempdir()?;
    let tsv_file = dir.path().join("xx.txt.gz");
    let tsv_file = tsv_file.to_str().unwrap();
    xx.to_tsv(tsv_file)?;

    let yy = DMatrix::<f64>::from_tsv(tsv_file, None)?;

    approx::assert_abs_diff_eq!(xx, yy, epsilon = 1e-12);

    Ok(())
}

#[test]
fn dmatrix_io_header_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let csv_file = dir.path().join("xx.csv");
    let csv_file = csv_file.to_str().unwrap();

    std::fs::write(csv_file, "# comment\na,b\n1,2\n3,4\n")?;

    let yy = DMatrix::<f32>::read_file_delim(csv_file, ",", Some(0))?;
    assert_eq!(yy.shape(), (2, 2));
    assert_eq!(yy[(1, 0)], 3.0);

    Ok(())
}

#[test]
fn dmatrix_io_ragged_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let tsv_file = dir.path().join("ragged.tsv");
    let tsv_file = tsv_file.to_str().unwrap();

    std::fs::write(tsv_file, "1\t2\n3\n")?;
    assert!(DMatrix::<f32>::from_tsv(tsv_file, None).is_err());

    std::fs::write(tsv_file, "1\tx\n")?;
    assert!(DMatrix::<f32>::from_tsv(tsv_file, None).is_err());

    Ok(())
}
