//! Distributed NMFk rank selection.
//!
//! Determines a suitable latent rank k for a non-negative matrix
//! factorization A ≈ W·Hᵀ by running an ensemble of independently perturbed
//! factorizations per candidate k on a logical pr×pc grid of workers,
//! aligning the resulting factor columns into a consensus order and scoring
//! cluster stability with silhouette widths.
//!
//! The pieces, bottom up:
//!
//! - [`solver`]: non-negative least squares by block principal pivoting,
//!   with a classical active-set fallback.
//! - [`dispatch`]: chunked parallel solves over a rank's owned right-hand
//!   side columns.
//! - [`grid`]: the worker grid and its collective operations.
//! - [`anls`]: the distributed alternating-update engine.
//! - [`align`] and [`stability`]: consensus alignment and silhouette
//!   scoring of the per-rank ensemble.
//! - [`runner`]: the sweep over candidate ranks.
//!
//! ```no_run
//! use dist_nmfk::config::NmfkConfig;
//! use dist_nmfk::grid::{GridShape, ProcessGrid};
//! use dist_nmfk::runner::{select_rank, NmfkRunner};
//! use dist_nmfk::shard::{dense_block, DenseShard};
//! # fn main() -> Result<(), dist_nmfk::error::NmfkError> {
//! let a = ndarray::Array2::<f64>::zeros((100, 80));
//! let cfg = NmfkConfig::default();
//! let shape = GridShape::new(cfg.grid_rows, cfg.grid_cols);
//! let grid = ProcessGrid::new(shape, cfg.world_size())?;
//! let summaries = grid.run(|comm| {
//!     let shard = DenseShard::new(dense_block(&a.view(), shape, comm.rank()));
//!     let runner = NmfkRunner::new(&comm, &shard, &cfg)?;
//!     let outcomes = runner.sweep()?;
//!     Ok(outcomes.iter().map(|o| o.summary()).collect::<Vec<_>>())
//! })?;
//! let _best = select_rank(&summaries[0]);
//! # Ok(())
//! # }
//! ```

pub mod align;
pub mod anls;
pub mod config;
pub mod dispatch;
pub mod ensemble;
pub mod error;
pub mod grid;
pub mod io;
pub mod perturb;
pub mod runner;
pub mod shard;
pub mod solver;
pub mod stability;
pub mod update;

pub use align::{align_ensemble, AlignmentOutcome};
pub use anls::{AnlsEngine, FactorShares, RunMetrics};
pub use config::{NmfkConfig, UpdateRule};
pub use ensemble::Ensemble;
pub use error::NmfkError;
pub use grid::{GridComm, GridShape, ProcessGrid};
pub use runner::{select_rank, NmfkRunner, RankOutcome, RankSummary};
pub use shard::{CsrShard, DenseShard, LocalMatrix};
pub use stability::silhouette_scores;
