use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// A random permutation of `0..ntot`
/// * `seed` - fix the permutation if given
pub fn shuffled_indices(ntot: usize, seed: Option<u64>) -> Vec<usize> {
    let mut idx = (0..ntot).collect::<Vec<_>>();
    match seed {
        Some(seed) => idx.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => idx.shuffle(&mut rand::rng()),
    }
    idx
}
