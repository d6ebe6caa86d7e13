//! Non-negative least squares by block principal pivoting.
//!
//! The algorithm of Kim and Park (SIAM J. Sci. Comput. 33(6), 2011):
//! partition the variable indices into a passive set F (free, solved exactly)
//! and an active set (clamped to zero), swap every violating index between
//! the two sets at once while the violation count keeps shrinking, and back
//! off to Murty's single-index rule when it stops shrinking. Each candidate
//! partition costs one symmetric positive-definite solve restricted to F.
//!
//! Inputs are in Gram form: `gram` = WᵗW (k×k) and `rhs` = Wᵗb, so solve
//! cost is independent of the number of observed rows.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::NmfkError;

use super::active_set::nnls_active_set;
use super::normal_eq::{
    group_identical_columns, passive_indices, solve_columns_on_passive, solve_on_passive,
};

/// Magnitudes below this are floating-point noise and are snapped to zero
/// before any sign test.
const ZERO_TOL: f64 = 1e-12;

/// Full-exchange attempts allowed after the violation count last shrank.
const BACKOFF_BUDGET: u32 = 3;

fn snap(v: f64) -> f64 {
    if v.abs() < ZERO_TOL {
        0.0
    } else {
        v
    }
}

/// Solves min ‖Gx − b‖ subject to x ≥ 0 for a single right-hand side.
///
/// Returns x ≥ 0 with y = Gx − b ≥ 0 and x∘y = 0 within tolerance. Falls
/// back to the classical active-set method if pivoting has not settled
/// after 2n exchanges. A singular restricted solve is fatal.
pub fn nnls_single(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView1<f64>,
) -> Result<Array1<f64>, NmfkError> {
    nnls_single_capped(gram, rhs, 2 * gram.nrows())
}

pub(crate) fn nnls_single_capped(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView1<f64>,
    max_exchanges: usize,
) -> Result<Array1<f64>, NmfkError> {
    let n = gram.nrows();
    if gram.ncols() != n || rhs.len() != n {
        return Err(NmfkError::ShapeMismatch(format!(
            "gram is {}x{} but rhs has {} entries",
            gram.nrows(),
            gram.ncols(),
            rhs.len()
        )));
    }
    if n == 0 {
        return Ok(Array1::zeros(0));
    }

    // x lives on the passive set, the dual residual y on the active set;
    // the empty passive set makes y = -b the starting residual
    let mut x = Array1::<f64>::zeros(n);
    let mut y = rhs.mapv(|v| -v);
    let mut passive = vec![false; n];
    let mut alpha = BACKOFF_BUDGET;
    let mut beta = n + 1;

    for _ in 0..max_exchanges {
        let mut violations: Vec<usize> = (0..n)
            .filter(|&i| {
                if passive[i] {
                    x[i] < 0.0
                } else {
                    y[i] < 0.0
                }
            })
            .collect();
        if violations.is_empty() {
            return Ok(x);
        }

        let mut forced = None;
        if violations.len() < beta {
            beta = violations.len();
            alpha = BACKOFF_BUDGET;
        } else if alpha >= 1 {
            alpha -= 1;
        } else {
            // Murty's rule: exchange only the highest violating index
            let last = *violations.last().unwrap();
            violations = vec![last];
            forced = Some(last);
        }
        for &i in &violations {
            passive[i] = !passive[i];
        }

        let idx: Vec<usize> = (0..n).filter(|&i| passive[i]).collect();
        x = solve_on_passive(gram, rhs, &idx)?;
        y = gram.dot(&x) - rhs;
        for &i in &idx {
            y[i] = 0.0;
        }
        x.mapv_inplace(snap);
        y.mapv_inplace(snap);
        if let Some(i) = forced {
            // rounding can leave the forced index marginally negative; pin
            // it so the same index is not selected forever
            if x[i] < 0.0 {
                x[i] = 0.0;
                y[i] = 0.0;
            }
        }
    }

    log::debug!(
        "block pivoting unsettled after {} exchanges on a {}-variable problem, \
         switching to active-set",
        max_exchanges,
        n
    );
    nnls_active_set(gram, rhs)
}

/// Solves min ‖GX − B‖ subject to X ≥ 0 column by column, sharing
/// factorizations between all columns whose passive patterns coincide.
///
/// The exchange heuristic state (α, β) is tracked per column; columns whose
/// violation set empties drop out of the iteration. Columns still violating
/// after 2n exchanges are finished off with the active-set method.
pub fn nnls_multi(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView2<f64>,
) -> Result<Array2<f64>, NmfkError> {
    nnls_multi_capped(gram, rhs, 2 * gram.nrows())
}

pub(crate) fn nnls_multi_capped(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView2<f64>,
    max_exchanges: usize,
) -> Result<Array2<f64>, NmfkError> {
    let n = gram.nrows();
    let r = rhs.ncols();
    if gram.ncols() != n || rhs.nrows() != n {
        return Err(NmfkError::ShapeMismatch(format!(
            "gram is {}x{} but rhs is {}x{}",
            gram.nrows(),
            gram.ncols(),
            rhs.nrows(),
            rhs.ncols()
        )));
    }
    if n == 0 || r == 0 {
        return Ok(Array2::zeros((n, r)));
    }

    let mut x = Array2::<f64>::zeros((n, r));
    let mut y = rhs.mapv(|v| -v);
    let mut passive = Array2::from_elem((n, r), false);
    let mut alpha = vec![BACKOFF_BUDGET; r];
    let mut beta = vec![n + 1; r];

    let mut iterations = 0usize;
    loop {
        let mut active_cols: Vec<usize> = Vec::new();
        let mut col_violations: Vec<Vec<usize>> = vec![Vec::new(); r];
        for c in 0..r {
            let v: Vec<usize> = (0..n)
                .filter(|&i| {
                    if passive[[i, c]] {
                        x[[i, c]] < 0.0
                    } else {
                        y[[i, c]] < 0.0
                    }
                })
                .collect();
            if !v.is_empty() {
                active_cols.push(c);
                col_violations[c] = v;
            }
        }
        if active_cols.is_empty() {
            return Ok(x);
        }

        iterations += 1;
        if iterations > max_exchanges {
            log::debug!(
                "{} of {} columns unsettled after {} exchanges, switching to active-set",
                active_cols.len(),
                r,
                max_exchanges
            );
            for &c in &active_cols {
                let col = nnls_active_set(gram, &rhs.column(c))?;
                x.column_mut(c).assign(&col);
            }
            return Ok(x);
        }

        let mut forced: Vec<Option<usize>> = vec![None; r];
        for &c in &active_cols {
            let violations = &mut col_violations[c];
            if violations.len() < beta[c] {
                beta[c] = violations.len();
                alpha[c] = BACKOFF_BUDGET;
            } else if alpha[c] >= 1 {
                alpha[c] -= 1;
            } else {
                let last = *violations.last().unwrap();
                violations.clear();
                violations.push(last);
                forced[c] = Some(last);
            }
            for &i in violations.iter() {
                passive[[i, c]] = !passive[[i, c]];
            }
        }

        // one factorization per distinct passive pattern
        let groups = group_identical_columns(&passive, &active_cols);
        for group in &groups {
            let pattern = passive_indices(&passive, group[0]);
            solve_columns_on_passive(gram, rhs, &pattern, group, &mut x)?;
        }

        for &c in &active_cols {
            let xc = x.column(c).to_owned();
            let mut yc = gram.dot(&xc) - rhs.column(c);
            for i in 0..n {
                if passive[[i, c]] {
                    yc[i] = 0.0;
                } else {
                    yc[i] = snap(yc[i]);
                }
                x[[i, c]] = snap(x[[i, c]]);
            }
            if let Some(i) = forced[c] {
                if x[[i, c]] < 0.0 {
                    x[[i, c]] = 0.0;
                    yc[i] = 0.0;
                }
            }
            y.column_mut(c).assign(&yc);
        }
    }
}
