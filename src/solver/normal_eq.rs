//! Restricted normal-equation solves and passive-set grouping.
//!
//! Every NNLS iteration resolves its candidate passive set with a symmetric
//! positive-definite solve on the Gram rows/columns of that set. Solves go
//! through the LAPACK Cholesky path; a factorization is computed once per
//! distinct passive pattern and reused for every column sharing it.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::cholesky::{FactorizeC, SolveC};
use ndarray_linalg::UPLO;

use crate::error::NmfkError;

pub(crate) fn gram_submatrix(gram: &ArrayView2<f64>, keep: &[usize]) -> Array2<f64> {
    Array2::from_shape_fn((keep.len(), keep.len()), |(i, j)| {
        gram[[keep[i], keep[j]]]
    })
}

/// Solves `G[F,F] z = b[F]` and scatters z back into a full-length vector
/// that is zero off F.
pub(crate) fn solve_on_passive(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView1<f64>,
    passive: &[usize],
) -> Result<Array1<f64>, NmfkError> {
    let mut x = Array1::zeros(gram.nrows());
    if passive.is_empty() {
        return Ok(x);
    }
    let sub = gram_submatrix(gram, passive);
    let chol = sub.factorizec(UPLO::Lower).map_err(|e| {
        NmfkError::NumericalSingularity(format!(
            "passive set of {} indices: {e}",
            passive.len()
        ))
    })?;
    let sub_rhs = Array1::from_shape_fn(passive.len(), |i| rhs[passive[i]]);
    let z = chol.solvec(&sub_rhs)?;
    for (value, &idx) in z.iter().zip(passive) {
        x[idx] = *value;
    }
    Ok(x)
}

/// Solves one passive pattern for several columns of `rhs`, reusing a single
/// factorization. The named columns of `x` are overwritten (zero off F).
pub(crate) fn solve_columns_on_passive(
    gram: &ArrayView2<f64>,
    rhs: &ArrayView2<f64>,
    passive: &[usize],
    columns: &[usize],
    x: &mut Array2<f64>,
) -> Result<(), NmfkError> {
    for &col in columns {
        x.column_mut(col).fill(0.0);
    }
    if passive.is_empty() {
        return Ok(());
    }
    let sub = gram_submatrix(gram, passive);
    let chol = sub.factorizec(UPLO::Lower).map_err(|e| {
        NmfkError::NumericalSingularity(format!(
            "passive set of {} indices shared by {} columns: {e}",
            passive.len(),
            columns.len()
        ))
    })?;
    for &col in columns {
        let sub_rhs = Array1::from_shape_fn(passive.len(), |i| rhs[[passive[i], col]]);
        let z = chol.solvec(&sub_rhs)?;
        for (value, &idx) in z.iter().zip(passive) {
            x[[idx, col]] = *value;
        }
    }
    Ok(())
}

/// Groups the given columns by identical passive pattern: sort the boolean
/// patterns lexicographically, then slice equal runs. One solve then serves
/// each group.
pub(crate) fn group_identical_columns(
    pass: &Array2<bool>,
    columns: &[usize],
) -> Vec<Vec<usize>> {
    let n = pass.nrows();
    let mut order = columns.to_vec();
    order.sort_by(|&a, &b| {
        for i in 0..n {
            match (pass[[i, a]], pass[[i, b]]) {
                (false, true) => return std::cmp::Ordering::Less,
                (true, false) => return std::cmp::Ordering::Greater,
                _ => {}
            }
        }
        a.cmp(&b)
    });
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for col in order {
        if let Some(last) = groups.last_mut() {
            let rep = last[0];
            if (0..n).all(|i| pass[[i, rep]] == pass[[i, col]]) {
                last.push(col);
                continue;
            }
        }
        groups.push(vec![col]);
    }
    groups
}

pub(crate) fn passive_indices(pass: &Array2<bool>, col: usize) -> Vec<usize> {
    (0..pass.nrows()).filter(|&i| pass[[i, col]]).collect()
}
