//! Per-rank accumulation of factor shares across the R runs of one sweep.
//!
//! Shares are stored as (row, column, run) so a run's slice is a plain 2-D
//! view and per-run column permutations touch one slice only. The arrays
//! are allocated once when a sweep starts and dropped as soon as alignment
//! and scoring have consumed them.

use ndarray::{s, Array3, ArrayView2, ArrayViewMut2};

use crate::anls::FactorShares;
use crate::error::NmfkError;

pub struct Ensemble {
    w: Array3<f64>,
    h: Array3<f64>,
}

impl Ensemble {
    pub fn new(w_rows: usize, h_rows: usize, k: usize, runs: usize) -> Self {
        Ensemble {
            w: Array3::zeros((w_rows, k, runs)),
            h: Array3::zeros((h_rows, k, runs)),
        }
    }

    pub fn runs(&self) -> usize {
        self.w.dim().2
    }

    pub fn k(&self) -> usize {
        self.w.dim().1
    }

    pub fn w_rows(&self) -> usize {
        self.w.dim().0
    }

    pub fn h_rows(&self) -> usize {
        self.h.dim().0
    }

    /// Copies a finished run's shares into slot `run`.
    pub fn store(&mut self, run: usize, shares: &FactorShares) -> Result<(), NmfkError> {
        if run >= self.runs()
            || shares.w.dim() != (self.w_rows(), self.k())
            || shares.h.dim() != (self.h_rows(), self.k())
        {
            return Err(NmfkError::ShapeMismatch(format!(
                "run {} shares {:?}/{:?} do not fit ensemble {:?}/{:?}",
                run,
                shares.w.dim(),
                shares.h.dim(),
                self.w.dim(),
                self.h.dim()
            )));
        }
        self.w.slice_mut(s![.., .., run]).assign(&shares.w);
        self.h.slice_mut(s![.., .., run]).assign(&shares.h);
        Ok(())
    }

    pub fn w_run(&self, run: usize) -> ArrayView2<'_, f64> {
        self.w.slice(s![.., .., run])
    }

    pub fn h_run(&self, run: usize) -> ArrayView2<'_, f64> {
        self.h.slice(s![.., .., run])
    }

    pub fn w_run_mut(&mut self, run: usize) -> ArrayViewMut2<'_, f64> {
        self.w.slice_mut(s![.., .., run])
    }

    pub fn h_run_mut(&mut self, run: usize) -> ArrayViewMut2<'_, f64> {
        self.h.slice_mut(s![.., .., run])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_store_and_slice_round_trip() {
        let mut ensemble = Ensemble::new(2, 3, 2, 2);
        let shares = FactorShares {
            w: array![[1.0, 2.0], [3.0, 4.0]],
            h: array![[5.0, 6.0], [7.0, 8.0], [9.0, 10.0]],
        };
        ensemble.store(1, &shares).unwrap();
        assert_eq!(ensemble.w_run(1), shares.w.view());
        assert_eq!(ensemble.h_run(1), shares.h.view());
        // slot 0 still zeroed
        assert!(ensemble.w_run(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_store_rejects_wrong_shapes() {
        let mut ensemble = Ensemble::new(2, 3, 2, 2);
        let shares = FactorShares {
            w: array![[1.0], [2.0]],
            h: array![[0.0], [0.0], [0.0]],
        };
        assert!(matches!(
            ensemble.store(0, &shares),
            Err(NmfkError::ShapeMismatch(_))
        ));
        let good = FactorShares {
            w: array![[0.0, 0.0], [0.0, 0.0]],
            h: array![[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
        };
        assert!(matches!(
            ensemble.store(5, &good),
            Err(NmfkError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_mutable_run_view_writes_through() {
        let mut ensemble = Ensemble::new(1, 1, 2, 3);
        ensemble.w_run_mut(2).fill(4.5);
        assert!(ensemble.w_run(2).iter().all(|&v| v == 4.5));
        assert!(ensemble.w_run(0).iter().all(|&v| v == 0.0));
    }
}
