//! The NMFk sweep: rank loop, ensemble loop, alignment and scoring.
//!
//! One runner lives on each rank and walks the candidate ranks in lockstep
//! with its peers. Per rank k it runs R factorizations, each from a fresh
//! perturbation of the local shard and a fresh seeded initialization, stores
//! the resulting shares in the ensemble cube, aligns the cube into a
//! canonical column order and scores cluster stability. Every distributed
//! decision (convergence, alignment permutations, scores) is derived from
//! grid-reduced values, so all ranks agree without extra coordination.

use std::time::Instant;

use ndarray::Array2;
use serde::Serialize;

use crate::align::{align_ensemble, AlignmentOutcome};
use crate::anls::{AnlsEngine, FactorShares, RunMetrics};
use crate::config::NmfkConfig;
use crate::ensemble::Ensemble;
use crate::error::NmfkError;
use crate::grid::GridComm;
use crate::perturb::{init_rng, perturb_rng, random_share};
use crate::shard::{block_range, h_share_range, w_share_range, LocalMatrix};
use crate::stability::silhouette_scores;
use crate::update::{updater_for, HalsUpdater};

/// Everything one rank knows about one evaluated rank k.
pub struct RankOutcome {
    pub k: usize,
    /// R×k silhouette widths, identical on every rank.
    pub silhouettes: Array2<f64>,
    /// Per-rank rows of the consensus factors and the deviation diagnostic.
    pub consensus: AlignmentOutcome,
    /// Per-run convergence metrics, identical on every rank.
    pub run_metrics: Vec<RunMetrics>,
}

/// Coordinator-facing digest of one rank evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RankSummary {
    pub k: usize,
    /// Smallest per-cluster mean width; the stability bottleneck at this k.
    pub min_width: f64,
    /// Mean width over all (run, cluster) pairs.
    pub mean_width: f64,
    pub mean_rel_error: f64,
    pub converged_runs: usize,
}

impl RankOutcome {
    pub fn summary(&self) -> RankSummary {
        let (runs, k) = self.silhouettes.dim();
        let mean_width = if runs * k > 0 {
            self.silhouettes.sum() / (runs * k) as f64
        } else {
            0.0
        };
        let min_width = (0..k)
            .map(|c| self.silhouettes.column(c).sum() / runs.max(1) as f64)
            .fold(f64::INFINITY, f64::min);
        let min_width = if min_width.is_finite() { min_width } else { 0.0 };
        let mean_rel_error = self
            .run_metrics
            .iter()
            .map(|m| m.rel_error)
            .sum::<f64>()
            / self.run_metrics.len().max(1) as f64;
        RankSummary {
            k: self.k,
            min_width,
            mean_width,
            mean_rel_error,
            converged_runs: self.run_metrics.iter().filter(|m| m.converged).count(),
        }
    }
}

/// Picks the candidate whose weakest cluster is most stable; ties go to the
/// smaller rank.
pub fn select_rank(summaries: &[RankSummary]) -> Option<usize> {
    summaries
        .iter()
        .max_by(|a, b| {
            a.min_width
                .partial_cmp(&b.min_width)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.k.cmp(&a.k))
        })
        .map(|s| s.k)
}

pub struct NmfkRunner<'a> {
    comm: &'a GridComm,
    shard: &'a dyn LocalMatrix,
    config: &'a NmfkConfig,
    /// Global row count of A, reduced once at construction.
    m: usize,
    /// Global column count of A.
    n: usize,
}

impl<'a> NmfkRunner<'a> {
    /// Binds the runner to one rank's shard. Global dimensions are recovered
    /// from the shard layout: row counts sum down a grid column, column
    /// counts sum along a grid row.
    pub fn new(
        comm: &'a GridComm,
        shard: &'a dyn LocalMatrix,
        config: &'a NmfkConfig,
    ) -> Result<Self, NmfkError> {
        let m = comm.grid_col().all_reduce_scalar(shard.nrows() as f64)? as usize;
        let n = comm.grid_row().all_reduce_scalar(shard.ncols() as f64)? as usize;
        Ok(NmfkRunner {
            comm,
            shard,
            config,
            m,
            n,
        })
    }

    pub fn global_dims(&self) -> (usize, usize) {
        (self.m, self.n)
    }

    /// Evaluates every candidate rank in [k_min, k_max], in order.
    pub fn sweep(&self) -> Result<Vec<RankOutcome>, NmfkError> {
        let mut outcomes = Vec::with_capacity(self.config.k_max - self.config.k_min + 1);
        for k in self.config.k_min..=self.config.k_max {
            outcomes.push(self.evaluate_rank(k)?);
        }
        Ok(outcomes)
    }

    /// One full ensemble pass at rank k: R perturbed runs, alignment,
    /// silhouette scoring.
    pub fn evaluate_rank(&self, k: usize) -> Result<RankOutcome, NmfkError> {
        let cfg = self.config;
        let rank = self.comm.rank();
        let (w_rows, h_rows) = self.share_rows();
        let started = Instant::now();

        let mut ensemble = Ensemble::new(w_rows, h_rows, k, cfg.runs);
        let mut run_metrics = Vec::with_capacity(cfg.runs);

        for run in 0..cfg.runs {
            let mut noise_rng = perturb_rng(cfg.seed, rank, k, run);
            let noisy = self.shard.perturbed(cfg.epsilon, &mut noise_rng);
            let engine = AnlsEngine::new(
                self.comm,
                noisy.as_ref(),
                k,
                cfg.reg_w,
                cfg.reg_h,
                cfg.chunk_cols,
            )?;

            let mut init = init_rng(cfg.seed, rank, k, run);
            let mut shares = FactorShares {
                w: random_share(w_rows, k, &mut init),
                h: random_share(h_rows, k, &mut init),
            };

            if cfg.warm_start_hals > 0 {
                let mut warm = HalsUpdater;
                engine.factorize(&mut warm, &mut shares, cfg.warm_start_hals, 0.0)?;
            }
            let mut updater = updater_for(cfg.rule);
            let metrics =
                engine.factorize(updater.as_mut(), &mut shares, cfg.max_outer_iter, cfg.tol)?;
            if self.comm.is_coordinator() {
                log::info!(
                    "k={k} run {run}: {} sweeps, relative error {:.4e}{}",
                    metrics.iterations,
                    metrics.rel_error,
                    if metrics.converged { ", converged" } else { "" }
                );
            }
            ensemble.store(run, &shares)?;
            run_metrics.push(metrics);
        }

        let consensus = align_ensemble(self.comm, &mut ensemble)?;
        let silhouettes = silhouette_scores(self.comm, &ensemble)?;
        if self.comm.is_coordinator() {
            log::info!(
                "k={k}: {} runs evaluated in {:.2?}",
                cfg.runs,
                started.elapsed()
            );
        }

        Ok(RankOutcome {
            k,
            silhouettes,
            consensus,
            run_metrics,
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

    /// Assembles the global m×k consensus W at the coordinator.
    pub fn gather_median_w(
        &self,
        outcome: &RankOutcome,
    ) -> Result<Option<Array2<f64>>, NmfkError> {
        self.gather_factor(&outcome.consensus.median_w, outcome.k, self.m, |rank| {
            w_share_range(self.m, self.comm.shape(), rank)
        })
    }

    /// Assembles the global n×k consensus H at the coordinator.
    pub fn gather_median_h(
        &self,
        outcome: &RankOutcome,
    ) -> Result<Option<Array2<f64>>, NmfkError> {
        self.gather_factor(&outcome.consensus.median_h, outcome.k, self.n, |rank| {
            h_share_range(self.n, self.comm.shape(), rank)
        })
    }

    /// Gathers per-rank factor shares and reassembles them at the
    /// coordinator by each rank's global row range. Non-coordinators
    /// participate in the collective and receive `None`.
    fn gather_factor(
        &self,
        share: &Array2<f64>,
        k: usize,
        total_rows: usize,
        range_of: impl Fn(usize) -> (usize, usize),
    ) -> Result<Option<Array2<f64>>, NmfkError> {
        let flat: Vec<f64> = share.iter().copied().collect();
        let parts = self.comm.world().gather(&flat, 0)?;
        let Some(parts) = parts else {
            return Ok(None);
        };
        let mut global = Array2::zeros((total_rows, k));
        for (rank, part) in parts.iter().enumerate() {
            let (start, len) = range_of(rank);
            if part.len() != len * k {
                return Err(NmfkError::ShapeMismatch(format!(
                    "rank {rank} sent {} values for a {len}x{k} share",
                    part.len()
                )));
            }
            for r in 0..len {
                for c in 0..k {
                    global[[start + r, c]] = part[r * k + c];
                }
            }
        }
        Ok(Some(global))
    }
}
