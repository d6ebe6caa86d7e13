//! Silhouette-based stability scoring of an aligned ensemble.
//!
//! After alignment, canonical column c of every run is one "point" of
//! cluster c, living on unit-norm vectors so cosine dissimilarity is
//! 1 − dot. For each run r and cluster c: a = average dissimilarity of run
//! r's column to the other members of cluster c, b = the smallest average
//! dissimilarity to any other cluster, and the silhouette width is
//! (b − a)/max(a, b) ∈ [−1, 1]. Widths near +1 across runs mean the
//! components at this k are stable under perturbation.
//!
//! Dot products are again local partials over row slices, reduced to R×R
//! blocks; nothing larger than R²k crosses rank boundaries.

use ndarray::{s, Array2, Array3};

use crate::ensemble::Ensemble;
use crate::error::NmfkError;
use crate::grid::GridComm;

/// Per-(run, cluster) silhouette widths. Ensembles with a single run or a
/// single cluster carry no separation signal; they score zero everywhere
/// rather than failing the sweep.
pub fn silhouette_scores(
    comm: &GridComm,
    ensemble: &Ensemble,
) -> Result<Array2<f64>, NmfkError> {
    let k = ensemble.k();
    let runs = ensemble.runs();
    if runs < 2 || k < 2 {
        log::warn!("silhouette undefined for runs={runs}, k={k}; reporting zero widths");
        return Ok(Array2::zeros((runs, k)));
    }

    let intra = intra_dissimilarity(comm, ensemble)?;
    let inter = inter_dissimilarity(comm, ensemble)?;

    let mut scores = Array2::zeros((runs, k));
    for r in 0..runs {
        for c in 0..k {
            let a = intra[[r, c]];
            let b = inter[[r, c]];
            let denom = a.max(b);
            scores[[r, c]] = if denom > 0.0 {
                (b - a) / denom
            } else {
                // coincident points in both views; no separation to measure
                log::debug!("silhouette 0/0 at run {r}, cluster {c}; scoring 0");
                0.0
            };
        }
    }
    Ok(scores)
}

/// Columns of cluster `c` across all runs, one run per column.
fn cluster_matrix(ensemble: &Ensemble, cluster: usize) -> Array2<f64> {
    let (rows, runs) = (ensemble.w_rows(), ensemble.runs());
    let mut cm = Array2::zeros((rows, runs));
    for r in 0..runs {
        cm.column_mut(r).assign(&ensemble.w_run(r).column(cluster));
    }
    cm
}

/// a-values: for every cluster, the R×R pairwise dot products reduced over
/// the grid, converted to dissimilarity, each row averaged over the R−1
/// other members.
fn intra_dissimilarity(comm: &GridComm, ensemble: &Ensemble) -> Result<Array2<f64>, NmfkError> {
    let k = ensemble.k();
    let runs = ensemble.runs();
    let mut dots = Array3::zeros((runs, runs, k));
    for c in 0..k {
        let cm = cluster_matrix(ensemble, c);
        dots.slice_mut(s![.., .., c]).assign(&cm.t().dot(&cm));
    }
    comm.world().all_reduce_array3(&mut dots)?;

    let mut intra = Array2::zeros((runs, k));
    for c in 0..k {
        for r in 0..runs {
            let total: f64 = dots
                .slice(s![r, .., c])
                .iter()
                .map(|&dot| 1.0 - dot)
                .sum();
            intra[[r, c]] = total / (runs as f64 - 1.0);
        }
    }
    Ok(intra)
}

/// b-values: for every cluster, cross dot products against each other
/// cluster, reduced, folded to |1 − dot|, row-averaged over R, then
/// minimized over the other clusters.
fn inter_dissimilarity(comm: &GridComm, ensemble: &Ensemble) -> Result<Array2<f64>, NmfkError> {
    let k = ensemble.k();
    let runs = ensemble.runs();
    let mut inter = Array2::zeros((runs, k));
    for c in 0..k {
        let cm = cluster_matrix(ensemble, c);
        let mut cross = Array3::zeros((runs, runs, k - 1));
        let mut slot = 0;
        for other in 0..k {
            if other == c {
                continue;
            }
            let om = cluster_matrix(ensemble, other);
            cross.slice_mut(s![.., .., slot]).assign(&cm.t().dot(&om));
            slot += 1;
        }
        comm.world().all_reduce_array3(&mut cross)?;

        for r in 0..runs {
            let mut best = f64::INFINITY;
            for slot in 0..k - 1 {
                let mean: f64 = cross
                    .slice(s![r, .., slot])
                    .iter()
                    .map(|&dot| (1.0 - dot).abs())
                    .sum::<f64>()
                    / runs as f64;
                if mean < best {
                    best = mean;
                }
            }
            inter[[r, c]] = best;
        }
    }
    Ok(inter)
}
