//! Distributed greedy consensus alignment of ensemble factor columns.
//!
//! Independent runs at the same rank produce the same latent components in
//! arbitrary column order. Alignment picks a canonical order: normalize W
//! columns to unit length so cosine similarity is a plain dot product, seed
//! the centroid set with run 0, then for a fixed number of rounds match
//! every run's columns to the centroids greedily and re-center on the
//! elementwise median of the aligned ensemble. Column permutations are
//! applied to the run's H slice as well, so the reported median pair stays
//! column-consistent.
//!
//! Ranks own row slices of the factors, so similarity is computed as local
//! partial products reduced over the whole grid; the greedy matching then
//! runs on identical k×k inputs everywhere and every rank derives the same
//! permutations without further communication.

use ndarray::{s, Array2, Array3, ArrayViewMut2, Zip};
use statrs::statistics::{Data, OrderStatistics};

use crate::ensemble::Ensemble;
use crate::error::NmfkError;
use crate::grid::GridComm;

const ALIGN_ROUNDS: usize = 3;

/// Consensus output of one aligned ensemble.
pub struct AlignmentOutcome {
    /// Per-rank rows of the consensus W (elementwise median over runs).
    pub median_w: Array2<f64>,
    /// Per-rank rows of the consensus H.
    pub median_h: Array2<f64>,
    /// Mean absolute deviation of aligned W columns from the median.
    pub mad_w: Array2<f64>,
    /// Per run, the map from original column index to canonical cluster.
    pub permutations: Vec<Vec<usize>>,
}

/// Aligns the ensemble in place and returns the consensus factors.
pub fn align_ensemble(
    comm: &GridComm,
    ensemble: &mut Ensemble,
) -> Result<AlignmentOutcome, NmfkError> {
    let k = ensemble.k();
    let runs = ensemble.runs();

    normalize_columns(comm, ensemble)?;

    // original_of[r][dest] = which original column currently sits at dest
    let mut original_of: Vec<Vec<usize>> = vec![(0..k).collect(); runs];
    let mut centroid = ensemble.w_run(0).to_owned();

    for _ in 0..ALIGN_ROUNDS {
        let mut sims = Array3::<f64>::zeros((k, k, runs));
        for r in 0..runs {
            let sim = centroid.t().dot(&ensemble.w_run(r));
            sims.slice_mut(s![.., .., r]).assign(&sim);
        }
        // each rank holds a row slice, so the true dot products are the
        // grid-wide sums of the local partials
        comm.world().all_reduce_array3(&mut sims)?;

        for r in 0..runs {
            let mut dissim = sims.slice(s![.., .., r]).mapv(|v| 1.0 - v);
            let perm = greedy_assign(&mut dissim);
            permute_columns(&mut ensemble.w_run_mut(r), &perm);
            permute_columns(&mut ensemble.h_run_mut(r), &perm);
            let remapped: Vec<usize> = perm.iter().map(|&src| original_of[r][src]).collect();
            original_of[r] = remapped;
        }

        centroid = median_stack(ensemble.w_rows(), k, runs, |i, c, r| {
            ensemble.w_run(r)[[i, c]]
        });
    }

    // the final centroid is exactly the median of the aligned W ensemble
    let median_w = centroid;
    let median_h = median_stack(ensemble.h_rows(), k, runs, |i, c, r| {
        ensemble.h_run(r)[[i, c]]
    });

    let mut mad_w = Array2::<f64>::zeros((ensemble.w_rows(), k));
    for r in 0..runs {
        let w = ensemble.w_run(r);
        Zip::from(&mut mad_w)
            .and(&w)
            .and(&median_w)
            .for_each(|m, &v, &med| *m += (v - med).abs());
    }
    mad_w /= runs as f64;

    let permutations = original_of
        .into_iter()
        .map(|inverse| {
            let mut forward = vec![0usize; k];
            for (dest, orig) in inverse.into_iter().enumerate() {
                forward[orig] = dest;
            }
            forward
        })
        .collect();

    log::debug!("alignment complete: k={k}, runs={runs}, rounds={ALIGN_ROUNDS}");
    Ok(AlignmentOutcome {
        median_w,
        median_h,
        mad_w,
        permutations,
    })
}

/// Rescales every W column of every run to unit L2 norm. Squared norms are
/// summed locally and reduced once for all (column, run) pairs; columns with
/// no mass are left untouched.
fn normalize_columns(comm: &GridComm, ensemble: &mut Ensemble) -> Result<(), NmfkError> {
    let (k, runs) = (ensemble.k(), ensemble.runs());
    let mut norms = Array2::<f64>::zeros((k, runs));
    for r in 0..runs {
        let w = ensemble.w_run(r);
        for c in 0..k {
            norms[[c, r]] = w.column(c).fold(0.0, |acc, &v| acc + v * v);
        }
    }
    comm.world().all_reduce_array2(&mut norms)?;
    for r in 0..runs {
        let mut w = ensemble.w_run_mut(r);
        for c in 0..k {
            let sq = norms[[c, r]];
            if sq > f64::MIN_POSITIVE {
                let inv = 1.0 / sq.sqrt();
                w.column_mut(c).mapv_inplace(|v| v * inv);
            }
        }
    }
    Ok(())
}

/// Greedy approximate assignment on a k×k dissimilarity matrix: extract the
/// smallest open entry k times, pairing centroid row with source column.
/// Extracted rows and columns are overwritten with their marginal totals,
/// which keeps them out of later minima; the explicit open-pair restriction
/// makes the result a bijection even under exact ties.
fn greedy_assign(dissim: &mut Array2<f64>) -> Vec<usize> {
    let k = dissim.nrows();
    let mut perm = vec![0usize; k];
    let mut row_done = vec![false; k];
    let mut col_done = vec![false; k];
    for _ in 0..k {
        let mut best: Option<(usize, usize, f64)> = None;
        for j in 0..k {
            if col_done[j] {
                continue;
            }
            for i in 0..k {
                if row_done[i] {
                    continue;
                }
                let v = dissim[[i, j]];
                if best.map_or(true, |(_, _, bv)| v < bv) {
                    best = Some((i, j, v));
                }
            }
        }
        let (bi, bj) = match best {
            Some((i, j, _)) => (i, j),
            None => break,
        };
        perm[bi] = bj;
        row_done[bi] = true;
        col_done[bj] = true;
        let col_totals: Vec<f64> = (0..k).map(|j| dissim.column(j).sum()).collect();
        let row_totals: Vec<f64> = (0..k).map(|i| dissim.row(i).sum()).collect();
        for j in 0..k {
            dissim[[bi, j]] = col_totals[j];
        }
        for i in 0..k {
            dissim[[i, bj]] = row_totals[i];
        }
    }
    perm
}

fn permute_columns(view: &mut ArrayViewMut2<f64>, perm: &[usize]) {
    let source = view.to_owned();
    for (dest, &src) in perm.iter().enumerate() {
        view.column_mut(dest).assign(&source.column(src));
    }
}

/// Elementwise median across runs of a (rows × k × runs) stack.
fn median_stack(
    rows: usize,
    k: usize,
    runs: usize,
    at: impl Fn(usize, usize, usize) -> f64,
) -> Array2<f64> {
    let mut out = Array2::zeros((rows, k));
    let mut buf = vec![0.0_f64; runs];
    for i in 0..rows {
        for c in 0..k {
            for (r, slot) in buf.iter_mut().enumerate() {
                *slot = at(i, c, r);
            }
            let mut data = Data::new(&mut buf[..]);
            out[[i, c]] = data.median();
        }
    }
    out
}
