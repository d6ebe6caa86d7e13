//! Shard input and result persistence.
//!
//! Input matrices travel as dense `.npy` files; results (median factors,
//! silhouette matrices) are written the same way, one array per file, so
//! downstream analysis scripts can load them directly. Synthetic generators
//! cover the no-input case: a uniform random matrix or a planted low-rank
//! product for validation runs.

use std::fs::File;
use std::path::Path;

use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;

use crate::error::NmfkError;

/// Reads a dense f64 matrix from a `.npy` file.
pub fn load_dense_npy(path: &Path) -> Result<Array2<f64>, NmfkError> {
    let reader = File::open(path)?;
    let matrix = Array2::<f64>::read_npy(reader)?;
    log::info!(
        "loaded {}x{} matrix from {}",
        matrix.nrows(),
        matrix.ncols(),
        path.display()
    );
    Ok(matrix)
}

/// Writes a dense f64 matrix as a `.npy` file, creating parent directories
/// as needed.
pub fn write_dense_npy(path: &Path, matrix: &Array2<f64>) -> Result<(), NmfkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let writer = File::create(path)?;
    matrix.write_npy(writer)?;
    Ok(())
}

/// Uniform [0,1) matrix for smoke runs.
pub fn random_matrix(m: usize, n: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::random_using((m, n), Uniform::new(0.0, 1.0), rng)
}

/// Non-negative matrix with a planted rank-k structure: a product of two
/// uniform factors plus optional uniform noise. The true rank is k, so a
/// sweep over a range containing k should score it as the most stable.
pub fn planted_low_rank(
    m: usize,
    n: usize,
    k: usize,
    noise: f64,
    rng: &mut StdRng,
) -> Array2<f64> {
    let w = Array2::random_using((m, k), Uniform::new(0.1, 1.0), rng);
    let h = Array2::random_using((n, k), Uniform::new(0.1, 1.0), rng);
    let mut a = w.dot(&h.t());
    if noise > 0.0 {
        let e = Array2::random_using((m, n), Uniform::new(0.0, noise), rng);
        a += &e;
    }
    a
}
