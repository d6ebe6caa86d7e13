//! Distributed alternating non-negative least squares over the process grid.
//!
//! Each outer sweep fixes one factor and refreshes the other from two
//! ingredients: the k×k Gram matrix of the fixed factor (local product,
//! world-reduced) and the local cross-product block (fixed factor assembled
//! along the perpendicular grid scope, multiplied into the local shard,
//! reduced along the parallel scope, then sliced down to the rows this rank
//! owns). Everything that crosses rank boundaries is k-wide, so collective
//! traffic is independent of the data size.
//!
//! Factor ownership follows a double split. W's m rows split pr ways across
//! grid rows; inside grid row i that block splits pc ways across the row's
//! members. H mirrors this with the roles of pr and pc exchanged. The
//! sub-splits line up with member order, so an all-gather along a grid row
//! reassembles W's row block exactly, and one along a grid column
//! reassembles H's.

use ndarray::{s, Array2};

use crate::error::NmfkError;
use crate::grid::GridComm;
use crate::shard::{block_range, LocalMatrix};
use crate::update::FactorUpdater;

/// Local shares of the factor pair held by one rank.
#[derive(Debug, Clone)]
pub struct FactorShares {
    pub w: Array2<f64>,
    pub h: Array2<f64>,
}

/// Outcome of one factorization run, identical on every rank.
#[derive(Debug, Clone, Copy)]
pub struct RunMetrics {
    pub iterations: usize,
    pub rel_error: f64,
    pub converged: bool,
}

pub struct AnlsEngine<'a> {
    comm: &'a GridComm,
    shard: &'a dyn LocalMatrix,
    k: usize,
    reg_w: f64,
    reg_h: f64,
    chunk_cols: usize,
    norm_a_sq: f64,
}

impl<'a> AnlsEngine<'a> {
    /// Binds the engine to one rank's shard. The global ‖A‖² is reduced once
    /// here and reused by every error evaluation.
    pub fn new(
        comm: &'a GridComm,
        shard: &'a dyn LocalMatrix,
        k: usize,
        reg_w: f64,
        reg_h: f64,
        chunk_cols: usize,
    ) -> Result<Self, NmfkError> {
        let norm_a_sq = comm.world().all_reduce_scalar(shard.sq_norm())?;
        Ok(AnlsEngine {
            comm,
            shard,
            k,
            reg_w,
            reg_h,
            chunk_cols,
            norm_a_sq,
        })
    }

    /// Row counts of this rank's W and H shares.
    pub fn share_rows(&self) -> (usize, usize) {
        let (i, j) = self.comm.coords();
        let shape = self.comm.shape();
        let (_, w_rows) = block_range(self.shard.nrows(), shape.cols, j);
        let (_, h_rows) = block_range(self.shard.ncols(), shape.rows, i);
        (w_rows, h_rows)
    }

    pub fn norm_a_sq(&self) -> f64 {
        self.norm_a_sq
    }

    /// Runs alternating sweeps from the given shares until the relative
    /// error stalls or `max_iter` sweeps complete. All ranks see identical
    /// reduced errors, so they take the convergence branch together.
    pub fn factorize(
        &self,
        updater: &mut dyn FactorUpdater,
        shares: &mut FactorShares,
        max_iter: usize,
        tol: f64,
    ) -> Result<RunMetrics, NmfkError> {
        let mut gram_w = self.gram_global(&shares.w)?;
        let mut previous = f64::INFINITY;
        let mut rel_error = f64::INFINITY;
        let mut iterations = 0;
        let mut converged = false;

        for sweep in 0..max_iter {
            iterations = sweep + 1;

            let cross_h = self.cross_for_h(&shares.w)?;
            let ridged_w = with_ridge(&gram_w, self.reg_h);
            updater.update_right(
                &ridged_w.view(),
                &cross_h.view(),
                &mut shares.h,
                self.chunk_cols,
            )?;

            let gram_h = self.gram_global(&shares.h)?;
            let cross_w = self.cross_for_w(&shares.h)?;
            let ridged_h = with_ridge(&gram_h, self.reg_w);
            updater.update_left(
                &ridged_h.view(),
                &cross_w.view(),
                &mut shares.w,
                self.chunk_cols,
            )?;

            gram_w = self.gram_global(&shares.w)?;
            rel_error = self.relative_error(&shares.w, &cross_w, &gram_w, &gram_h)?;
            if self.comm.is_coordinator() {
                log::debug!("sweep {iterations}: relative error {rel_error:.6e}");
            }
            if updater.converged(previous, rel_error, tol) {
                converged = true;
                break;
            }
            previous = rel_error;
        }

        Ok(RunMetrics {
            iterations,
            rel_error,
            converged,
        })
    }

    /// Gram matrix of a factor from its local share: shares tile the global
    /// rows, so the world sum of local products is the true k×k Gram.
    fn gram_global(&self, share: &Array2<f64>) -> Result<Array2<f64>, NmfkError> {
        let mut gram = share.t().dot(share);
        self.comm.world().all_reduce_array2(&mut gram)?;
        Ok(gram)
    }

    /// This rank's rows of AᵗW: assemble W's row block along the grid row,
    /// multiply into the local shard, sum the grid column, keep own rows.
    fn cross_for_h(&self, w_share: &Array2<f64>) -> Result<Array2<f64>, NmfkError> {
        let w_block = self.comm.grid_row().all_gather_rows(&w_share.view())?;
        let mut partial = self.shard.t_dot(&w_block.view());
        self.comm.grid_col().all_reduce_array2(&mut partial)?;
        let (i, _) = self.comm.coords();
        let (h0, h_rows) = block_range(self.shard.ncols(), self.comm.shape().rows, i);
        Ok(partial.slice(s![h0..h0 + h_rows, ..]).to_owned())
    }

    /// This rank's rows of AH, mirror of [`Self::cross_for_h`].
    fn cross_for_w(&self, h_share: &Array2<f64>) -> Result<Array2<f64>, NmfkError> {
        let h_block = self.comm.grid_col().all_gather_rows(&h_share.view())?;
        let mut partial = self.shard.dot(&h_block.view());
        self.comm.grid_row().all_reduce_array2(&mut partial)?;
        let (_, j) = self.comm.coords();
        let (w0, w_rows) = block_range(self.shard.nrows(), self.comm.shape().cols, j);
        Ok(partial.slice(s![w0..w0 + w_rows, ..]).to_owned())
    }

    /// ‖A − WHᵗ‖/‖A‖ through the expanded square: ‖A‖² cached at startup,
    /// ⟨W, AH⟩ a scalar world reduction over the shares, the trace term a
    /// local product of two replicated k×k matrices.
    fn relative_error(
        &self,
        w_share: &Array2<f64>,
        cross_w: &Array2<f64>,
        gram_w: &Array2<f64>,
        gram_h: &Array2<f64>,
    ) -> Result<f64, NmfkError> {
        let local_inner = (w_share * cross_w).sum();
        let inner = self.comm.world().all_reduce_scalar(local_inner)?;
        let trace = (gram_w * gram_h).sum();
        if self.norm_a_sq <= 0.0 {
            return Ok(0.0);
        }
        let err_sq = (self.norm_a_sq - 2.0 * inner + trace).max(0.0);
        Ok((err_sq / self.norm_a_sq).sqrt())
    }
}

fn with_ridge(gram: &Array2<f64>, reg: f64) -> Array2<f64> {
    let mut out = gram.clone();
    if reg > 0.0 {
        for i in 0..out.nrows() {
            out[[i, i]] += reg;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridShape, ProcessGrid};
    use crate::shard::{dense_block, h_share_range, w_share_range, DenseShard};
    use crate::update::{updater_for, BppUpdater};
    use ndarray::{Array2, ArrayView2};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn planted(seed: u64, m: usize, n: usize, k: usize) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = Array2::random_using((m, k), Uniform::new(0.1, 1.0), &mut rng);
        let h = Array2::random_using((n, k), Uniform::new(0.1, 1.0), &mut rng);
        let a = w.dot(&h.t());
        (a, w, h)
    }

    fn share_of(global: &ArrayView2<f64>, range: (usize, usize)) -> Array2<f64> {
        let (start, len) = range;
        global.slice(s![start..start + len, ..]).to_owned()
    }

    #[test]
    fn test_single_rank_cross_products_match_direct() {
        let (a, w, h) = planted(1, 6, 5, 3);
        let grid = ProcessGrid::new(GridShape::new(1, 1), 1).unwrap();
        let (a_in, w_in, h_in) = (a.clone(), w.clone(), h.clone());
        grid.run(move |comm| {
            let shard = DenseShard::new(a_in.clone());
            let engine = AnlsEngine::new(&comm, &shard, 3, 0.0, 0.0, 64)?;
            let ath = engine.cross_for_h(&w_in)?;
            let expect = a_in.t().dot(&w_in);
            assert!(ath.iter().zip(expect.iter()).all(|(x, y)| (x - y).abs() < 1e-12));
            let ah = engine.cross_for_w(&h_in)?;
            let expect = a_in.dot(&h_in);
            assert!(ah.iter().zip(expect.iter()).all(|(x, y)| (x - y).abs() < 1e-12));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_grid_cross_products_match_direct() {
        let (a, w, h) = planted(2, 7, 6, 2);
        let shape = GridShape::new(2, 2);
        let grid = ProcessGrid::new(shape, 4).unwrap();
        let ath_full = a.t().dot(&w);
        let ah_full = a.dot(&h);
        grid.run(|comm| {
            let shard = DenseShard::new(dense_block(&a.view(), shape, comm.rank()));
            let engine = AnlsEngine::new(&comm, &shard, 2, 0.0, 0.0, 64)?;

            let w_share = share_of(&w.view(), w_share_range(7, shape, comm.rank()));
            let ath = engine.cross_for_h(&w_share)?;
            let expect = share_of(&ath_full.view(), h_share_range(6, shape, comm.rank()));
            assert_eq!(ath.dim(), expect.dim());
            assert!(ath.iter().zip(expect.iter()).all(|(x, y)| (x - y).abs() < 1e-10));

            let h_share = share_of(&h.view(), h_share_range(6, shape, comm.rank()));
            let ah = engine.cross_for_w(&h_share)?;
            let expect = share_of(&ah_full.view(), w_share_range(7, shape, comm.rank()));
            assert_eq!(ah.dim(), expect.dim());
            assert!(ah.iter().zip(expect.iter()).all(|(x, y)| (x - y).abs() < 1e-10));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_grid_gram_matches_direct() {
        let (_, w, _) = planted(3, 9, 4, 3);
        let shape = GridShape::new(2, 2);
        let grid = ProcessGrid::new(shape, 4).unwrap();
        let gram_full = w.t().dot(&w);
        grid.run(|comm| {
            let shard = DenseShard::new(Array2::zeros((
                crate::shard::block_range(9, 2, comm.coords().0).1,
                crate::shard::block_range(4, 2, comm.coords().1).1,
            )));
            let engine = AnlsEngine::new(&comm, &shard, 3, 0.0, 0.0, 64)?;
            let w_share = share_of(&w.view(), w_share_range(9, shape, comm.rank()));
            let gram = engine.gram_global(&w_share)?;
            assert!(gram
                .iter()
                .zip(gram_full.iter())
                .all(|(x, y)| (x - y).abs() < 1e-10));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_single_rank_factorization_recovers_planted_rank() {
        let (a, _, _) = planted(4, 8, 6, 2);
        let grid = ProcessGrid::new(GridShape::new(1, 1), 1).unwrap();
        let metrics = grid
            .run(|comm| {
                let shard = DenseShard::new(a.clone());
                let engine = AnlsEngine::new(&comm, &shard, 2, 0.0, 0.0, 64)?;
                let mut rng = StdRng::seed_from_u64(99);
                let mut shares = FactorShares {
                    w: Array2::random_using((8, 2), Uniform::new(0.0, 1.0), &mut rng),
                    h: Array2::random_using((6, 2), Uniform::new(0.0, 1.0), &mut rng),
                };
                let mut updater = BppUpdater;
                let metrics = engine.factorize(&mut updater, &mut shares, 40, 1e-9)?;
                assert!(shares.w.iter().all(|&v| v >= 0.0));
                assert!(shares.h.iter().all(|&v| v >= 0.0));
                Ok(metrics)
            })
            .unwrap();
        assert!(metrics[0].rel_error < 0.05, "rel_error {}", metrics[0].rel_error);
        assert!(metrics[0].iterations >= 2);
    }

    #[test]
    fn test_factorization_is_deterministic_across_executions() {
        let (a, _, _) = planted(5, 6, 5, 2);
        let shape = GridShape::new(2, 2);
        let run_once = || {
            let grid = ProcessGrid::new(shape, 4).unwrap();
            grid.run(|comm| {
                let shard = DenseShard::new(dense_block(&a.view(), shape, comm.rank()));
                let engine = AnlsEngine::new(&comm, &shard, 2, 0.0, 0.0, 64)?;
                let (w_rows, h_rows) = engine.share_rows();
                let mut rng = StdRng::seed_from_u64(1000 + comm.rank() as u64);
                let mut shares = FactorShares {
                    w: Array2::random_using((w_rows, 2), Uniform::new(0.0, 1.0), &mut rng),
                    h: Array2::random_using((h_rows, 2), Uniform::new(0.0, 1.0), &mut rng),
                };
                let mut updater = updater_for(crate::config::UpdateRule::Bpp);
                let metrics = engine.factorize(updater.as_mut(), &mut shares, 10, 0.0)?;
                Ok((metrics.rel_error, shares.w, shares.h))
            })
            .unwrap()
        };
        let first = run_once();
        let second = run_once();
        for (one, two) in first.iter().zip(second.iter()) {
            assert_eq!(one.0.to_bits(), two.0.to_bits());
            assert_eq!(one.1, two.1);
            assert_eq!(one.2, two.2);
        }
        // reduced error is a single value the whole grid agrees on
        for entry in &first[1..] {
            assert_eq!(entry.0.to_bits(), first[0].0.to_bits());
        }
    }

    #[test]
    fn test_regularizer_shrinks_factor_norms() {
        let (a, _, _) = planted(6, 8, 6, 2);
        let run_with = |reg: f64| {
            let grid = ProcessGrid::new(GridShape::new(1, 1), 1).unwrap();
            let out = grid
                .run(|comm| {
                    let shard = DenseShard::new(a.clone());
                    let engine = AnlsEngine::new(&comm, &shard, 2, reg, reg, 64)?;
                    let mut rng = StdRng::seed_from_u64(7);
                    let mut shares = FactorShares {
                        w: Array2::random_using((8, 2), Uniform::new(0.0, 1.0), &mut rng),
                        h: Array2::random_using((6, 2), Uniform::new(0.0, 1.0), &mut rng),
                    };
                    let mut updater = BppUpdater;
                    engine.factorize(&mut updater, &mut shares, 15, 0.0)?;
                    Ok(shares.h.mapv(|v| v * v).sum())
                })
                .unwrap();
            out[0]
        };
        let plain = run_with(0.0);
        let damped = run_with(5.0);
        assert!(damped < plain, "{damped} !< {plain}");
    }
}
