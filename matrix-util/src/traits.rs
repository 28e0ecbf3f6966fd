use crate::common_io::Delimiter;

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", skip)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    fn to_csv(&self, csv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(csv_file, ",")
    }
}

/// Routines on symmetric (positive definite) matrices
pub trait SymMatOps {
    type Mat;
    type Scalar;

    /// `(X + X') / 2`
    fn symmetrize(&self) -> Self::Mat;

    /// Project to the nearest symmetric positive definite matrix by
    /// lifting every eigenvalue below `eval_threshold` up to it.
    /// Fails if the matrix is not square.
    fn make_symposdef(&self, eval_threshold: Self::Scalar) -> anyhow::Result<Self::Mat>;

    /// `log|X|` via Cholesky; fails if `X` is not positive definite
    fn logdet_spd(&self) -> anyhow::Result<Self::Scalar>;

    /// `X^{-1}`; fails if `X` is singular
    fn inverse_checked(&self) -> anyhow::Result<Self::Mat>;
}
