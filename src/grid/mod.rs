//! Logical pr x pc process grid and its collective operations.
//!
//! Worker "processes" are OS threads, one per rank, spawned together for the
//! lifetime of a sweep. Ranks own disjoint data and coordinate exclusively
//! through the collectives here: all-reduce, all-gather and gather over the
//! whole grid or over one grid row/column, plus barriers. Reductions read
//! deposit slots in ascending rank order, so every member of a scope computes
//! a bitwise-identical result and repeated executions are deterministic.
//!
//! Every collective is a hard synchronization point. A rank that fails posts
//! a group abort through the shared barrier core; every peer blocked in (or
//! later entering) a collective returns [`NmfkError::GroupAborted`] carrying
//! the originating rank and reason. Panics are not caught.

mod sync;

use std::sync::{Arc, Mutex};
use std::thread;

use ndarray::{Array2, Array3, ArrayView2};

use crate::error::NmfkError;
use sync::WorldSync;

/// Shape of the logical process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    pub fn new(rows: usize, cols: usize) -> Self {
        GridShape { rows, cols }
    }

    pub fn size(&self) -> usize {
        self.rows * self.cols
    }
}

struct ScopeShared {
    slots: Vec<Mutex<Vec<f64>>>,
    barrier: usize,
}

/// Per-rank handle to one collective scope: the whole grid, this rank's grid
/// row, or this rank's grid column. Members are ordered by world rank.
pub struct Scope {
    shared: Arc<ScopeShared>,
    sync: Arc<WorldSync>,
    pos: usize,
}

impl Scope {
    pub fn members(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn deposit(&self, data: &[f64]) {
        let mut slot = self.shared.slots[self.pos].lock().unwrap();
        slot.clear();
        slot.extend_from_slice(data);
    }

    fn wait(&self) -> Result<(), NmfkError> {
        self.sync.wait(self.shared.barrier, self.members())
    }

    /// Elementwise sum of every member's buffer, written back into `buf` on
    /// every member. Buffers must have equal lengths across the scope.
    pub fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), NmfkError> {
        self.deposit(buf);
        self.wait()?;
        for v in buf.iter_mut() {
            *v = 0.0;
        }
        // fixed member order keeps the summation identical on every rank
        for slot in &self.shared.slots {
            let slot = slot.lock().unwrap();
            if slot.len() != buf.len() {
                return Err(NmfkError::ShapeMismatch(format!(
                    "all-reduce buffers disagree: {} vs {}",
                    slot.len(),
                    buf.len()
                )));
            }
            for (acc, x) in buf.iter_mut().zip(slot.iter()) {
                *acc += x;
            }
        }
        self.wait()
    }

    pub fn all_reduce_array2(&self, arr: &mut Array2<f64>) -> Result<(), NmfkError> {
        let buf = arr
            .as_slice_mut()
            .expect("owned arrays use standard layout");
        self.all_reduce_sum(buf)
    }

    pub fn all_reduce_array3(&self, arr: &mut Array3<f64>) -> Result<(), NmfkError> {
        let buf = arr
            .as_slice_mut()
            .expect("owned arrays use standard layout");
        self.all_reduce_sum(buf)
    }

    pub fn all_reduce_scalar(&self, value: f64) -> Result<f64, NmfkError> {
        let mut buf = [value];
        self.all_reduce_sum(&mut buf)?;
        Ok(buf[0])
    }

    /// Row-stacks every member's block in member order; every member receives
    /// the full stack. Blocks must agree on the column count.
    pub fn all_gather_rows(&self, block: &ArrayView2<f64>) -> Result<Array2<f64>, NmfkError> {
        let ncols = block.ncols();
        let flat: Vec<f64> = block.iter().copied().collect();
        self.deposit(&flat);
        self.wait()?;
        let mut stacked = Vec::new();
        for slot in &self.shared.slots {
            let slot = slot.lock().unwrap();
            stacked.extend_from_slice(&slot);
        }
        self.wait()?;
        if ncols == 0 {
            return Ok(Array2::zeros((0, 0)));
        }
        if stacked.len() % ncols != 0 {
            return Err(NmfkError::ShapeMismatch(
                "gathered blocks disagree on column count".into(),
            ));
        }
        let total_rows = stacked.len() / ncols;
        Array2::from_shape_vec((total_rows, ncols), stacked)
            .map_err(|e| NmfkError::ShapeMismatch(e.to_string()))
    }

    /// Collects every member's buffer at member `root`, in member order.
    /// Returns `Some` only at the root.
    pub fn gather(&self, data: &[f64], root: usize) -> Result<Option<Vec<Vec<f64>>>, NmfkError> {
        self.deposit(data);
        self.wait()?;
        let collected = if self.pos == root {
            let mut parts = Vec::with_capacity(self.members());
            for slot in &self.shared.slots {
                parts.push(slot.lock().unwrap().clone());
            }
            Some(parts)
        } else {
            None
        };
        self.wait()?;
        Ok(collected)
    }
}

/// Per-rank communicator handle: identity on the grid plus the three
/// collective scopes.
pub struct GridComm {
    rank: usize,
    shape: GridShape,
    world: Scope,
    row: Scope,
    col: Scope,
    sync: Arc<WorldSync>,
}

impl GridComm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn world_size(&self) -> usize {
        self.shape.size()
    }

    /// (grid row, grid column) of this rank; ranks are laid out row-major.
    pub fn coords(&self) -> (usize, usize) {
        (self.rank / self.shape.cols, self.rank % self.shape.cols)
    }

    /// Rank 0 persists consolidated diagnostics; nothing else distinguishes
    /// it.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Scope over all pr*pc ranks.
    pub fn world(&self) -> &Scope {
        &self.world
    }

    /// Scope over the pc ranks sharing this rank's grid row.
    pub fn grid_row(&self) -> &Scope {
        &self.row
    }

    /// Scope over the pr ranks sharing this rank's grid column.
    pub fn grid_col(&self) -> &Scope {
        &self.col
    }

    pub fn barrier(&self) -> Result<(), NmfkError> {
        self.world.wait()
    }

    /// Posts a group abort; peers observe it at their next collective.
    pub fn abort(&self, reason: &str) {
        self.sync.abort(self.rank, reason);
    }
}

/// Entry point for running a worker group over a fixed grid shape.
pub struct ProcessGrid {
    shape: GridShape,
}

impl ProcessGrid {
    /// Validates the distributed configuration before anything runs: the
    /// grid shape must account for exactly the requested worker count.
    pub fn new(shape: GridShape, workers: usize) -> Result<Self, NmfkError> {
        if shape.rows == 0 || shape.cols == 0 || shape.size() != workers {
            return Err(NmfkError::CollectiveMismatch {
                grid_rows: shape.rows,
                grid_cols: shape.cols,
                workers,
            });
        }
        Ok(ProcessGrid { shape })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Runs `f` once per rank, each on its own OS thread, and returns the
    /// per-rank results in rank order. The first non-abort error (lowest
    /// rank) is returned after the whole group has unwound.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>, NmfkError>
    where
        F: Fn(GridComm) -> Result<T, NmfkError> + Sync,
        T: Send,
    {
        let shape = self.shape;
        let world_size = shape.size();
        // barrier 0 is the world; rows and columns follow
        let sync = Arc::new(WorldSync::new(1 + shape.rows + shape.cols));

        let make_scope = |members: usize, barrier: usize| {
            Arc::new(ScopeShared {
                slots: (0..members).map(|_| Mutex::new(Vec::new())).collect(),
                barrier,
            })
        };
        let world_shared = make_scope(world_size, 0);
        let row_shared: Vec<_> = (0..shape.rows).map(|i| make_scope(shape.cols, 1 + i)).collect();
        let col_shared: Vec<_> = (0..shape.cols)
            .map(|j| make_scope(shape.rows, 1 + shape.rows + j))
            .collect();

        thread::scope(|s| {
            let mut handles = Vec::with_capacity(world_size);
            for rank in 0..world_size {
                let (i, j) = (rank / shape.cols, rank % shape.cols);
                let comm = GridComm {
                    rank,
                    shape,
                    world: Scope {
                        shared: world_shared.clone(),
                        sync: sync.clone(),
                        pos: rank,
                    },
                    row: Scope {
                        shared: row_shared[i].clone(),
                        sync: sync.clone(),
                        pos: j,
                    },
                    col: Scope {
                        shared: col_shared[j].clone(),
                        sync: sync.clone(),
                        pos: i,
                    },
                    sync: sync.clone(),
                };
                let f = &f;
                let sync = sync.clone();
                handles.push(s.spawn(move || match f(comm) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        if !matches!(e, NmfkError::GroupAborted { .. }) {
                            log::error!("rank {rank} aborting group: {e}");
                            sync.abort(rank, &e.to_string());
                        }
                        Err(e)
                    }
                }));
            }

            let mut results = Vec::with_capacity(world_size);
            let mut first_error = None;
            let mut abort_error = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(value)) => results.push(value),
                    Ok(Err(e @ NmfkError::GroupAborted { .. })) => {
                        abort_error.get_or_insert(e);
                    }
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            match (first_error, abort_error) {
                (Some(e), _) => Err(e),
                (None, Some(e)) => Err(e),
                (None, None) => Ok(results),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mismatched_grid_is_rejected_before_running() {
        let err = ProcessGrid::new(GridShape::new(2, 2), 3).err().unwrap();
        assert!(matches!(err, NmfkError::CollectiveMismatch { workers: 3, .. }));
        assert!(ProcessGrid::new(GridShape::new(0, 4), 0).is_err());
    }

    #[test]
    fn test_world_all_reduce_sums_every_rank() {
        let grid = ProcessGrid::new(GridShape::new(2, 3), 6).unwrap();
        let results = grid
            .run(|comm| {
                let mut buf = [comm.rank() as f64, 1.0];
                comm.world().all_reduce_sum(&mut buf)?;
                Ok(buf)
            })
            .unwrap();
        for buf in results {
            assert_eq!(buf, [15.0, 6.0]);
        }
    }

    #[test]
    fn test_row_and_col_scopes_sum_their_members_only() {
        let grid = ProcessGrid::new(GridShape::new(2, 3), 6).unwrap();
        let results = grid
            .run(|comm| {
                let mut row_buf = [comm.rank() as f64];
                comm.grid_row().all_reduce_sum(&mut row_buf)?;
                let mut col_buf = [comm.rank() as f64];
                comm.grid_col().all_reduce_sum(&mut col_buf)?;
                Ok((comm.coords(), row_buf[0], col_buf[0]))
            })
            .unwrap();
        for ((i, j), row_sum, col_sum) in results {
            // row i holds ranks {3i, 3i+1, 3i+2}; column j holds {j, j+3}
            assert_eq!(row_sum, (3 * i + (3 * i + 1) + (3 * i + 2)) as f64);
            assert_eq!(col_sum, (j + (j + 3)) as f64);
        }
    }

    #[test]
    fn test_all_gather_rows_stacks_in_rank_order() {
        let grid = ProcessGrid::new(GridShape::new(2, 2), 4).unwrap();
        let results = grid
            .run(|comm| {
                let block = array![[comm.rank() as f64, 10.0 + comm.rank() as f64]];
                comm.world().all_gather_rows(&block.view())
            })
            .unwrap();
        let expected = array![
            [0.0, 10.0],
            [1.0, 11.0],
            [2.0, 12.0],
            [3.0, 13.0]
        ];
        for stacked in results {
            assert_eq!(stacked, expected);
        }
    }

    #[test]
    fn test_gather_collects_at_root_only() {
        let grid = ProcessGrid::new(GridShape::new(1, 3), 3).unwrap();
        let results = grid
            .run(|comm| {
                let data = [comm.rank() as f64; 2];
                comm.world().gather(&data, 0)
            })
            .unwrap();
        assert_eq!(
            results[0],
            Some(vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]])
        );
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_reduction_is_bitwise_identical_across_ranks_and_runs() {
        let run_once = || {
            let grid = ProcessGrid::new(GridShape::new(2, 2), 4).unwrap();
            grid.run(|comm| {
                // values chosen so summation order matters in floating point
                let mut buf = [0.1 * (comm.rank() as f64 + 1.0), 1e-9, 1e9];
                comm.world().all_reduce_sum(&mut buf)?;
                Ok(buf)
            })
            .unwrap()
        };
        let first = run_once();
        let second = run_once();
        for buf in &first[1..] {
            assert_eq!(*buf, first[0]);
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_rank_aborts_the_group() {
        let grid = ProcessGrid::new(GridShape::new(1, 2), 2).unwrap();
        let err = grid
            .run(|comm| {
                if comm.rank() == 0 {
                    return Err(NmfkError::NumericalSingularity(
                        "forced failure".into(),
                    ));
                }
                // rank 1 parks in a collective and must be released
                let mut buf = [1.0];
                comm.world().all_reduce_sum(&mut buf)?;
                Ok(buf[0])
            })
            .err()
            .unwrap();
        assert!(matches!(err, NmfkError::NumericalSingularity(_)));
    }

    #[test]
    fn test_posted_abort_releases_peers_from_collectives() {
        let grid = ProcessGrid::new(GridShape::new(1, 3), 3).unwrap();
        let err = grid
            .run(|comm| {
                if comm.rank() == 2 {
                    // a healthy rank can cancel the group, e.g. on an
                    // external stop request
                    comm.abort("stop requested");
                }
                let mut buf = [1.0];
                comm.world().all_reduce_sum(&mut buf)?;
                Ok(buf[0])
            })
            .err()
            .unwrap();
        match err {
            NmfkError::GroupAborted { origin, reason } => {
                assert_eq!(origin, 2);
                assert_eq!(reason, "stop requested");
            }
            other => panic!("expected a group abort, got {other}"),
        }
    }

    #[test]
    fn test_barrier_smoke() {
        let grid = ProcessGrid::new(GridShape::new(2, 1), 2).unwrap();
        let results = grid
            .run(|comm| {
                comm.barrier()?;
                comm.barrier()?;
                Ok(comm.is_coordinator())
            })
            .unwrap();
        assert_eq!(results, vec![true, false]);
    }
}
