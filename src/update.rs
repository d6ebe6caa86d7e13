//! Alternating-update rules for the two factor shares.
//!
//! Every rule consumes the same pair of inputs: the k×k Gram matrix of the
//! currently-fixed factor (already grid-reduced, ridge applied) and the
//! local cross-product block with one row per locally owned row of the
//! factor being refreshed. The rule rewrites that local share in place.
//! Block principal pivoting is the default; multiplicative updates, HALS
//! and AO-ADMM are kept as cheaper alternatives for large or ill-behaved
//! problems.

use ndarray::{Array2, ArrayView2, Zip};
use ndarray_linalg::cholesky::{FactorizeC, SolveC};
use ndarray_linalg::UPLO;

use crate::config::UpdateRule;
use crate::dispatch::solve_columns;
use crate::error::NmfkError;

/// Multiplicative and column-wise rules keep entries at or above this floor
/// so later iterations can still move them.
const NONNEG_FLOOR: f64 = 1e-16;

const ADMM_INNER_ITERS: usize = 5;
const ADMM_RESIDUAL_TOL: f64 = 0.01;

pub trait FactorUpdater: Send {
    /// Refreshes the local share of the left factor W given HᵗH and the
    /// local block of AH.
    fn update_left(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        chunk_cols: usize,
    ) -> Result<(), NmfkError>;

    /// Refreshes the local share of the right factor H given WᵗW and the
    /// local block of AᵗW.
    fn update_right(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        chunk_cols: usize,
    ) -> Result<(), NmfkError>;

    /// Relative-change stopping test on consecutive error values.
    fn converged(&self, previous: f64, current: f64, tol: f64) -> bool {
        if tol <= 0.0 || !previous.is_finite() || !current.is_finite() {
            return false;
        }
        (previous - current).abs() <= tol * previous.abs().max(1.0)
    }
}

pub fn updater_for(rule: UpdateRule) -> Box<dyn FactorUpdater> {
    match rule {
        UpdateRule::Bpp => Box::new(BppUpdater),
        UpdateRule::Hals => Box::new(HalsUpdater),
        UpdateRule::Mu => Box::new(MuUpdater),
        UpdateRule::AoAdmm => Box::new(AoAdmmUpdater::default()),
    }
}

/// Exact per-block NNLS via block principal pivoting; one transposed solve
/// per share, dispatched over column chunks.
pub struct BppUpdater;

impl BppUpdater {
    fn solve_share(
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        let rhs = cross.t();
        let solved = solve_columns(gram, &rhs, chunk_cols)?;
        share.assign(&solved.t());
        Ok(())
    }
}

impl FactorUpdater for BppUpdater {
    fn update_left(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::solve_share(gram, cross, share, chunk_cols)
    }

    fn update_right(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::solve_share(gram, cross, share, chunk_cols)
    }
}

/// Hierarchical ALS: exact coordinate minimization column by column,
/// projected to the non-negative orthant.
pub struct HalsUpdater;

impl HalsUpdater {
    fn refresh(gram: &ArrayView2<f64>, cross: &ArrayView2<f64>, share: &mut Array2<f64>) {
        let k = gram.nrows();
        for x in 0..k {
            let gxx = gram[[x, x]];
            if gxx.abs() < NONNEG_FLOOR {
                continue;
            }
            let mut col = share.column(x).to_owned();
            col *= gxx;
            col += &cross.column(x);
            col -= &share.dot(&gram.column(x));
            col /= gxx;
            col.mapv_inplace(|v| v.max(NONNEG_FLOOR));
            share.column_mut(x).assign(&col);
        }
    }
}

impl FactorUpdater for HalsUpdater {
    fn update_left(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share);
        Ok(())
    }

    fn update_right(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share);
        Ok(())
    }
}

/// Lee-Seung multiplicative updates; monotone but slow near stationarity.
pub struct MuUpdater;

impl MuUpdater {
    fn refresh(gram: &ArrayView2<f64>, cross: &ArrayView2<f64>, share: &mut Array2<f64>) {
        let denom = share.dot(gram);
        Zip::from(&mut *share)
            .and(cross)
            .and(&denom)
            .for_each(|s, &c, &d| {
                *s = (*s * c / (d + NONNEG_FLOOR)).max(NONNEG_FLOOR);
            });
    }
}

impl FactorUpdater for MuUpdater {
    fn update_left(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share);
        Ok(())
    }

    fn update_right(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share);
        Ok(())
    }
}

/// Alternating-optimization ADMM. Each side carries its own scaled dual
/// variable across outer iterations; the proximal system (G + ρI) is
/// factorized once per call and reused for every inner sweep.
#[derive(Default)]
pub struct AoAdmmUpdater {
    dual_left: Option<Array2<f64>>,
    dual_right: Option<Array2<f64>>,
}

impl AoAdmmUpdater {
    fn refresh(
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        dual_slot: &mut Option<Array2<f64>>,
    ) -> Result<(), NmfkError> {
        let k = gram.nrows();
        let rows = share.nrows();
        let dims = share.dim();
        let dual = dual_slot.get_or_insert_with(|| Array2::zeros(dims));
        if dual.dim() != dims {
            *dual = Array2::zeros(dims);
        }

        let rho = gram.diag().sum() / k.max(1) as f64;
        let mut shifted = gram.to_owned();
        for i in 0..k {
            shifted[[i, i]] += rho;
        }
        let chol = shifted.factorizec(UPLO::Lower).map_err(|e| {
            NmfkError::NumericalSingularity(format!("admm proximal system (rho={rho:.3e}): {e}"))
        })?;

        let mut aux = Array2::<f64>::zeros(dims);
        for _ in 0..ADMM_INNER_ITERS {
            let mut target = share.clone();
            target += &*dual;
            target *= rho;
            target += cross;
            for i in 0..rows {
                let row = target.row(i).to_owned();
                let solved = chol.solvec(&row)?;
                aux.row_mut(i).assign(&solved);
            }

            let previous = share.clone();
            Zip::from(&mut *share).and(&aux).and(&*dual).for_each(|s, &a, &d| {
                *s = (a - d).max(0.0);
            });
            Zip::from(&mut *dual).and(&*share).and(&aux).for_each(|d, &s, &a| {
                *d += s - a;
            });

            let primal = (&*share - &aux).mapv(|v| v * v).sum().sqrt();
            let dual_shift = (&*share - &previous).mapv(|v| v * v).sum().sqrt();
            let share_norm = share.mapv(|v| v * v).sum().sqrt();
            let dual_norm = dual.mapv(|v| v * v).sum().sqrt();
            if primal <= ADMM_RESIDUAL_TOL * share_norm.max(NONNEG_FLOOR)
                && dual_shift <= ADMM_RESIDUAL_TOL * dual_norm.max(NONNEG_FLOOR)
            {
                break;
            }
        }
        Ok(())
    }
}

impl FactorUpdater for AoAdmmUpdater {
    fn update_left(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share, &mut self.dual_left)
    }

    fn update_right(
        &mut self,
        gram: &ArrayView2<f64>,
        cross: &ArrayView2<f64>,
        share: &mut Array2<f64>,
        _chunk_cols: usize,
    ) -> Result<(), NmfkError> {
        Self::refresh(gram, cross, share, &mut self.dual_right)
    }
}
