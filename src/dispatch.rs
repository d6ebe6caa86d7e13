//! Chunked parallel dispatch of NNLS column blocks.
//!
//! A worker's owned right-hand-side columns are split into contiguous
//! fixed-size chunks and each chunk is solved independently on the rayon
//! pool. Chunks write disjoint column ranges of the output, so the workers
//! never contend. Column order inside the output matches the input.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};

use crate::error::NmfkError;
use crate::solver::{nnls_multi, nnls_single};

/// Chunk width balancing per-task overhead against parallel granularity.
pub const DEFAULT_CHUNK_COLS: usize = 64;

/// Solves min ‖GX − B‖ subject to X ≥ 0 over the columns of `rhs`.
///
/// Zero- and one-column blocks skip the multi-column machinery entirely.
pub fn solve_columns(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView2<f64>,
    chunk_cols: usize,
) -> Result<Array2<f64>, NmfkError> {
    let n = gram.nrows();
    let r = rhs.ncols();
    if r == 0 {
        return Ok(Array2::zeros((n, 0)));
    }
    if r == 1 {
        let x = nnls_single(gram, &rhs.column(0))?;
        return Ok(x.insert_axis(Axis(1)));
    }
    let chunk = chunk_cols.max(1);
    if r <= chunk {
        return nnls_multi(gram, rhs);
    }

    let mut out = Array2::<f64>::zeros((n, r));
    out.axis_chunks_iter_mut(Axis(1), chunk)
        .into_par_iter()
        .zip(rhs.axis_chunks_iter(Axis(1), chunk).into_par_iter())
        .try_for_each(|(mut dst, src)| -> Result<(), NmfkError> {
            let solved = if src.ncols() == 1 {
                nnls_single(gram, &src.column(0))?.insert_axis(Axis(1))
            } else {
                nnls_multi(gram, &src)?
            };
            dst.assign(&solved);
            Ok(())
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_problem(seed: u64, n: usize, r: usize) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let base = Array2::random_using((2 * n, n), Uniform::new(0.0, 1.0), &mut rng);
        let mut gram = base.t().dot(&base);
        for i in 0..n {
            gram[[i, i]] += 0.1;
        }
        let rhs = Array2::random_using((n, r), Uniform::new(-1.0, 1.0), &mut rng);
        (gram, rhs)
    }

    #[test]
    fn test_chunked_dispatch_matches_monolithic_solve() {
        let (gram, rhs) = random_problem(3, 6, 25);
        let whole = nnls_multi(&gram.view(), &rhs.view()).unwrap();
        for chunk in [1usize, 3, 7, 64] {
            let chunked = solve_columns(&gram.view(), &rhs.view(), chunk).unwrap();
            for ((i, j), v) in chunked.indexed_iter() {
                assert!(
                    (v - whole[[i, j]]).abs() < 1e-10,
                    "chunk={chunk} at ({i},{j}): {v} vs {}",
                    whole[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_empty_block_returns_empty() {
        let (gram, _) = random_problem(5, 4, 1);
        let rhs = Array2::<f64>::zeros((4, 0));
        let out = solve_columns(&gram.view(), &rhs.view(), 8).unwrap();
        assert_eq!(out.dim(), (4, 0));
    }

    #[test]
    fn test_single_column_block() {
        let (gram, rhs) = random_problem(9, 5, 1);
        let out = solve_columns(&gram.view(), &rhs.view(), 8).unwrap();
        let single = nnls_single(&gram.view(), &rhs.column(0)).unwrap();
        assert_eq!(out.dim(), (5, 1));
        for i in 0..5 {
            assert!((out[[i, 0]] - single[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_chunk_width_is_lifted_to_one() {
        let (gram, rhs) = random_problem(13, 4, 5);
        let out = solve_columns(&gram.view(), &rhs.view(), 0).unwrap();
        let whole = nnls_multi(&gram.view(), &rhs.view()).unwrap();
        for ((i, j), v) in out.indexed_iter() {
            assert!((v - whole[[i, j]]).abs() < 1e-10);
        }
    }
}
