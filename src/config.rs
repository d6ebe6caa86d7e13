//! Run configuration: rank range, ensemble size, update rule, grid shape.
//!
//! Read once before the sweep starts and never mutated mid-loop; every
//! component borrows what it needs from here.

use serde::{Deserialize, Serialize};

use crate::error::NmfkError;

/// Alternating-update rule used inside each factorization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRule {
    /// Block principal pivoting NNLS (the default; exact alternating solves).
    Bpp,
    /// Hierarchical alternating least squares, one column at a time.
    Hals,
    /// Multiplicative update.
    Mu,
    /// Alternating-optimization ADMM on each NNLS subproblem.
    AoAdmm,
}

impl UpdateRule {
    pub fn parse(name: &str) -> Result<Self, NmfkError> {
        match name.to_ascii_lowercase().as_str() {
            "bpp" => Ok(UpdateRule::Bpp),
            "hals" => Ok(UpdateRule::Hals),
            "mu" => Ok(UpdateRule::Mu),
            "aoadmm" | "admm" => Ok(UpdateRule::AoAdmm),
            other => Err(NmfkError::InvalidConfig(format!(
                "unknown update rule '{other}' (expected bpp, hals, mu or aoadmm)"
            ))),
        }
    }
}

/// Parameters of one NMFk sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmfkConfig {
    /// Smallest candidate rank, inclusive.
    pub k_min: usize,
    /// Largest candidate rank, inclusive.
    pub k_max: usize,
    /// Ensemble size R: perturbed factorization runs per candidate rank.
    pub runs: usize,
    pub rule: UpdateRule,
    /// Alternating (outer) iterations per run.
    pub max_outer_iter: usize,
    /// Relative-change tolerance on the reconstruction error; 0 disables the
    /// test and every run uses the full iteration budget.
    pub tol: f64,
    /// Ridge weight added to the Gram diagonal when updating W.
    pub reg_w: f64,
    /// Ridge weight added to the Gram diagonal when updating H.
    pub reg_h: f64,
    /// Perturbation magnitude: each run multiplies the shard elementwise by
    /// factors drawn from [1-epsilon, 1+epsilon].
    pub epsilon: f64,
    /// Process grid height (pr).
    pub grid_rows: usize,
    /// Process grid width (pc).
    pub grid_cols: usize,
    /// Column width of one dispatcher chunk.
    pub chunk_cols: usize,
    /// HALS iterations run before the configured rule to warm-start each run;
    /// 0 disables.
    pub warm_start_hals: usize,
    /// Base seed for the per-(rank, k, run) random streams.
    pub seed: u64,
    /// Worker threads for the column-block dispatcher pool.
    pub threads: usize,
}

impl Default for NmfkConfig {
    fn default() -> Self {
        NmfkConfig {
            k_min: 2,
            k_max: 4,
            runs: 10,
            rule: UpdateRule::Bpp,
            max_outer_iter: 30,
            tol: 0.0,
            reg_w: 0.0,
            reg_h: 0.0,
            epsilon: 1e-3,
            grid_rows: 1,
            grid_cols: 1,
            chunk_cols: 64,
            warm_start_hals: 0,
            seed: 17,
            threads: num_cpus::get(),
        }
    }
}

impl NmfkConfig {
    /// Number of logical worker processes the grid shape implies.
    pub fn world_size(&self) -> usize {
        self.grid_rows * self.grid_cols
    }

    pub fn validate(&self) -> Result<(), NmfkError> {
        if self.k_min == 0 {
            return Err(NmfkError::InvalidConfig("k_min must be at least 1".into()));
        }
        if self.k_max < self.k_min {
            return Err(NmfkError::InvalidConfig(format!(
                "k_max ({}) below k_min ({})",
                self.k_max, self.k_min
            )));
        }
        if self.runs == 0 {
            return Err(NmfkError::InvalidConfig(
                "ensemble needs at least one run".into(),
            ));
        }
        if self.max_outer_iter == 0 {
            return Err(NmfkError::InvalidConfig(
                "max_outer_iter must be positive".into(),
            ));
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err(NmfkError::InvalidConfig(format!(
                "degenerate grid {}x{}",
                self.grid_rows, self.grid_cols
            )));
        }
        if self.chunk_cols == 0 {
            return Err(NmfkError::InvalidConfig(
                "chunk_cols must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.epsilon) {
            return Err(NmfkError::InvalidConfig(format!(
                "perturbation magnitude {} outside [0, 1)",
                self.epsilon
            )));
        }
        if self.reg_w < 0.0 || self.reg_h < 0.0 {
            return Err(NmfkError::InvalidConfig(
                "regularization weights must be non-negative".into(),
            ));
        }
        if self.tol < 0.0 {
            return Err(NmfkError::InvalidConfig(
                "tolerance must be non-negative".into(),
            ));
        }
        if self.threads == 0 {
            return Err(NmfkError::InvalidConfig("threads must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NmfkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_rank_range() {
        let cfg = NmfkConfig {
            k_min: 5,
            k_max: 3,
            ..NmfkConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(NmfkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_runs_and_degenerate_grid() {
        let cfg = NmfkConfig {
            runs: 0,
            ..NmfkConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = NmfkConfig {
            grid_rows: 0,
            ..NmfkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_perturbation_of_one_or_more() {
        let cfg = NmfkConfig {
            epsilon: 1.0,
            ..NmfkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rule_parsing() {
        assert_eq!(UpdateRule::parse("BPP").unwrap(), UpdateRule::Bpp);
        assert_eq!(UpdateRule::parse("hals").unwrap(), UpdateRule::Hals);
        assert_eq!(UpdateRule::parse("admm").unwrap(), UpdateRule::AoAdmm);
        assert!(UpdateRule::parse("newton").is_err());
    }

    #[test]
    fn test_world_size() {
        let cfg = NmfkConfig {
            grid_rows: 2,
            grid_cols: 3,
            ..NmfkConfig::default()
        };
        assert_eq!(cfg.world_size(), 6);
    }
}
