//! Process-local views of the distributed input matrix.
//!
//! The factorization engine only ever touches its own block of A through the
//! [`LocalMatrix`] capability set, so dense and sparse storage are picked per
//! run at startup and everything downstream stays storage-agnostic.

use ndarray::{s, Array2, ArrayView2};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::NmfkError;
use crate::grid::GridShape;

/// Operations the alternating-update engine needs from a local block of A.
pub trait LocalMatrix: Send + Sync {
    /// Rows of the local block.
    fn nrows(&self) -> usize;
    /// Columns of the local block.
    fn ncols(&self) -> usize;
    /// `blockᵗ · dense`, shape (ncols, dense.ncols()).
    fn t_dot(&self, dense: &ArrayView2<f64>) -> Array2<f64>;
    /// `block · dense`, shape (nrows, dense.ncols()).
    fn dot(&self, dense: &ArrayView2<f64>) -> Array2<f64>;
    /// Squared Frobenius norm of the local block.
    fn sq_norm(&self) -> f64;
    /// Copy of the block with every stored entry multiplied by an independent
    /// factor drawn from [1-eps, 1+eps].
    fn perturbed(&self, eps: f64, rng: &mut StdRng) -> Box<dyn LocalMatrix>;
}

/// Dense shard backed by a plain `Array2<f64>`.
pub struct DenseShard {
    data: Array2<f64>,
}

impl DenseShard {
    pub fn new(data: Array2<f64>) -> Self {
        DenseShard { data }
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

impl LocalMatrix for DenseShard {
    fn nrows(&self) -> usize {
        self.data.nrows()
    }

    fn ncols(&self) -> usize {
        self.data.ncols()
    }

    fn t_dot(&self, dense: &ArrayView2<f64>) -> Array2<f64> {
        self.data.t().dot(dense)
    }

    fn dot(&self, dense: &ArrayView2<f64>) -> Array2<f64> {
        self.data.dot(dense)
    }

    fn sq_norm(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    fn perturbed(&self, eps: f64, rng: &mut StdRng) -> Box<dyn LocalMatrix> {
        if eps <= 0.0 {
            return Box::new(DenseShard::new(self.data.clone()));
        }
        let noise = Uniform::new(-eps, eps);
        let data = self.data.mapv(|v| v * (1.0 + rng.sample(noise)));
        Box::new(DenseShard::new(data))
    }
}

/// Sparse shard in compressed-sparse-row form. Multiplicative perturbation
/// leaves structural zeros untouched, so only stored values are scaled.
pub struct CsrShard {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrShard {
    /// Builds a CSR shard from (row, col, value) triplets; duplicates are
    /// summed, exact zeros are kept out of the structure.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, NmfkError> {
        for &(r, c, _) in triplets {
            if r >= nrows || c >= ncols {
                return Err(NmfkError::ShapeMismatch(format!(
                    "triplet ({r}, {c}) outside {nrows}x{ncols} shard"
                )));
            }
        }
        let mut sorted: Vec<(usize, usize, f64)> = triplets
            .iter()
            .copied()
            .filter(|&(_, _, v)| v != 0.0)
            .collect();
        sorted.sort_by_key(|&(r, c, _)| (r, c));

        let mut row_ptr = vec![0usize; nrows + 1];
        let mut col_idx = Vec::with_capacity(sorted.len());
        let mut values: Vec<f64> = Vec::with_capacity(sorted.len());
        let mut prev = None;
        for (r, c, v) in sorted {
            if prev == Some((r, c)) {
                if let Some(last) = values.last_mut() {
                    *last += v;
                }
            } else {
                col_idx.push(c);
                values.push(v);
                row_ptr[r + 1] += 1;
                prev = Some((r, c));
            }
        }
        // per-row counts to offsets
        for r in 0..nrows {
            row_ptr[r + 1] += row_ptr[r];
        }
        Ok(CsrShard {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values,
        })
    }

    /// Converts a dense block into CSR, dropping exact zeros.
    pub fn from_dense(dense: &ArrayView2<f64>) -> Self {
        let (nrows, ncols) = dense.dim();
        let mut row_ptr = vec![0usize; nrows + 1];
        let mut col_idx = Vec::new();
        let mut values = Vec::new();
        for r in 0..nrows {
            for c in 0..ncols {
                let v = dense[[r, c]];
                if v != 0.0 {
                    col_idx.push(c);
                    values.push(v);
                }
            }
            row_ptr[r + 1] = col_idx.len();
        }
        CsrShard {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values,
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }
}

impl LocalMatrix for CsrShard {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn t_dot(&self, dense: &ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((self.ncols, dense.ncols()));
        for r in 0..self.nrows {
            let row = dense.row(r);
            for idx in self.row_ptr[r]..self.row_ptr[r + 1] {
                let c = self.col_idx[idx];
                let v = self.values[idx];
                out.row_mut(c).scaled_add(v, &row);
            }
        }
        out
    }

    fn dot(&self, dense: &ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((self.nrows, dense.ncols()));
        for r in 0..self.nrows {
            let mut out_row = out.row_mut(r);
            for idx in self.row_ptr[r]..self.row_ptr[r + 1] {
                let c = self.col_idx[idx];
                let v = self.values[idx];
                out_row.scaled_add(v, &dense.row(c));
            }
        }
        out
    }

    fn sq_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }

    fn perturbed(&self, eps: f64, rng: &mut StdRng) -> Box<dyn LocalMatrix> {
        let values = if eps <= 0.0 {
            self.values.clone()
        } else {
            let noise = Uniform::new(-eps, eps);
            self.values
                .iter()
                .map(|v| v * (1.0 + rng.sample(noise)))
                .collect()
        };
        Box::new(CsrShard {
            nrows: self.nrows,
            ncols: self.ncols,
            row_ptr: self.row_ptr.clone(),
            col_idx: self.col_idx.clone(),
            values,
        })
    }
}

/// Balanced contiguous split of `len` items into `parts` blocks; the first
/// `len % parts` blocks take one extra item. Returns (start, length) of block
/// `idx`. Blocks are disjoint and cover the whole range in order.
pub fn block_range(len: usize, parts: usize, idx: usize) -> (usize, usize) {
    debug_assert!(parts > 0 && idx < parts);
    let base = len / parts;
    let extra = len % parts;
    if idx < extra {
        (idx * (base + 1), base + 1)
    } else {
        (extra * (base + 1) + (idx - extra) * base, base)
    }
}

/// Carves the (i,j) block of a global m×n matrix owned by `rank` on a
/// row-major grid: rows split pr ways, columns pc ways.
pub fn dense_block(global: &ArrayView2<f64>, shape: GridShape, rank: usize) -> Array2<f64> {
    let (i, j) = (rank / shape.cols, rank % shape.cols);
    let (r0, rlen) = block_range(global.nrows(), shape.rows, i);
    let (c0, clen) = block_range(global.ncols(), shape.cols, j);
    global.slice(s![r0..r0 + rlen, c0..c0 + clen]).to_owned()
}

/// Global row range `[start, start+len)` of the W share owned by `rank`.
///
/// The m rows split pr ways across grid rows; each grid row's block splits
/// again pc ways across its members, so shares tile `[0, m)` exactly and the
/// pc shares of grid row i tile that row's block in member order.
pub fn w_share_range(m: usize, shape: GridShape, rank: usize) -> (usize, usize) {
    let (i, j) = (rank / shape.cols, rank % shape.cols);
    let (r0, rlen) = block_range(m, shape.rows, i);
    let (s0, slen) = block_range(rlen, shape.cols, j);
    (r0 + s0, slen)
}

/// Global row range `[start, start+len)` of the H share owned by `rank`.
///
/// Mirror of [`w_share_range`]: the n rows of H split pc ways across grid
/// columns, then pr ways inside each grid column.
pub fn h_share_range(n: usize, shape: GridShape, rank: usize) -> (usize, usize) {
    let (i, j) = (rank / shape.cols, rank % shape.cols);
    let (c0, clen) = block_range(n, shape.cols, j);
    let (s0, slen) = block_range(clen, shape.rows, i);
    (c0 + s0, slen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn sample_dense() -> Array2<f64> {
        array![
            [1.0, 0.0, 2.0],
            [0.0, 0.0, 0.0],
            [3.0, 4.0, 0.0],
            [0.0, 5.0, 6.0],
        ]
    }

    #[test]
    fn test_block_range_covers_and_is_disjoint() {
        for &(len, parts) in &[(10usize, 3usize), (7, 7), (5, 2), (4, 6), (0, 3), (12, 4)] {
            let mut next = 0;
            let mut total = 0;
            for idx in 0..parts {
                let (start, size) = block_range(len, parts, idx);
                assert_eq!(start, next, "len={len} parts={parts} idx={idx}");
                next = start + size;
                total += size;
            }
            assert_eq!(total, len);
        }
    }

    #[test]
    fn test_block_range_is_balanced() {
        let sizes: Vec<usize> = (0..4).map(|i| block_range(10, 4, i).1).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
    }

    #[test]
    fn test_share_ranges_tile_the_global_rows() {
        for &(len, rows, cols) in &[(11usize, 2usize, 3usize), (8, 2, 2), (5, 1, 4), (3, 2, 2)] {
            let shape = GridShape::new(rows, cols);
            // W shares walk ranks row-major and must cover [0, len) in order
            let mut next = 0;
            for rank in 0..shape.size() {
                let (start, size) = w_share_range(len, shape, rank);
                assert_eq!(start, next, "len={len} grid={rows}x{cols} rank={rank}");
                next += size;
            }
            assert_eq!(next, len);
            // H shares cover [0, len) when walked column-major
            let mut next = 0;
            for j in 0..cols {
                for i in 0..rows {
                    let (start, size) = h_share_range(len, shape, i * cols + j);
                    assert_eq!(start, next);
                    next += size;
                }
            }
            assert_eq!(next, len);
        }
    }

    #[test]
    fn test_dense_blocks_tile_the_global_matrix() {
        let global = Array2::from_shape_fn((5, 7), |(i, j)| (10 * i + j) as f64);
        let shape = GridShape::new(2, 3);
        let mut seen = Array2::<f64>::zeros((5, 7));
        for rank in 0..shape.size() {
            let block = dense_block(&global.view(), shape, rank);
            let (i, j) = (rank / shape.cols, rank % shape.cols);
            let (r0, rlen) = block_range(5, shape.rows, i);
            let (c0, clen) = block_range(7, shape.cols, j);
            assert_eq!(block.dim(), (rlen, clen));
            seen.slice_mut(s![r0..r0 + rlen, c0..c0 + clen]).assign(&block);
        }
        assert_eq!(seen, global);
    }

    #[test]
    fn test_csr_matches_dense_products() {
        let dense = sample_dense();
        let shard_d = DenseShard::new(dense.clone());
        let shard_s = CsrShard::from_dense(&dense.view());
        assert_eq!(shard_s.nnz(), 6);

        let w = array![[1.0, 2.0], [0.5, 1.0], [2.0, 0.0], [1.0, 1.0]];
        let h = array![[1.0, 0.0], [2.0, 1.0], [0.0, 3.0]];

        let td_d = shard_d.t_dot(&w.view());
        let td_s = shard_s.t_dot(&w.view());
        assert!(td_d
            .iter()
            .zip(td_s.iter())
            .all(|(a, b)| (a - b).abs() < 1e-12));

        let d_d = shard_d.dot(&h.view());
        let d_s = shard_s.dot(&h.view());
        assert!(d_d
            .iter()
            .zip(d_s.iter())
            .all(|(a, b)| (a - b).abs() < 1e-12));

        assert!((shard_d.sq_norm() - shard_s.sq_norm()).abs() < 1e-12);
    }

    #[test]
    fn test_csr_from_triplets_sums_duplicates() {
        let shard =
            CsrShard::from_triplets(2, 2, &[(0, 1, 1.0), (0, 1, 2.0), (1, 0, 4.0)]).unwrap();
        let id = array![[1.0, 0.0], [0.0, 1.0]];
        let full = shard.dot(&id.view());
        assert_eq!(full, array![[0.0, 3.0], [4.0, 0.0]]);
    }

    #[test]
    fn test_csr_rejects_out_of_bounds() {
        assert!(CsrShard::from_triplets(2, 2, &[(2, 0, 1.0)]).is_err());
    }

    #[test]
    fn test_perturbation_stays_within_bounds() {
        let dense = sample_dense();
        let shard = DenseShard::new(dense.clone());
        let eps = 0.05;
        let mut rng = StdRng::seed_from_u64(7);
        let noisy = shard.perturbed(eps, &mut rng);
        let probe = Array2::eye(3);
        let noisy_full = noisy.dot(&probe.view());
        for (orig, pert) in dense.iter().zip(noisy_full.iter()) {
            assert!((pert - orig).abs() <= eps * orig.abs() + 1e-12);
        }
    }

    #[test]
    fn test_perturbation_is_reproducible() {
        let shard = DenseShard::new(sample_dense());
        let probe = Array2::eye(3);
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = shard.perturbed(0.01, &mut rng_a).dot(&probe.view());
        let b = shard.perturbed(0.01, &mut rng_b).dot(&probe.view());
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_eps_is_identity() {
        let shard = DenseShard::new(sample_dense());
        let mut rng = StdRng::seed_from_u64(1);
        let copy = shard.perturbed(0.0, &mut rng);
        let probe = Array2::eye(3);
        assert_eq!(shard.dot(&probe.view()), copy.dot(&probe.view()));
    }
}
