//! NNLS solvers operating on precomputed Gram-form subproblems.

mod active_set;
mod bpp;
mod normal_eq;

pub use bpp::{nnls_multi, nnls_single};
