use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::ThreadPool;
use thiserror::Error;

use crate::error::{Result, SolverError};
use crate::field::Grid;

/// Default tile edge, sized for a typical L2 slice
pub const DEFAULT_TILE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl WorkUnit {
    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }
}

/// How units are handed to the workers of a region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dispatch {
    Static,
    Dynamic,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Schedule {
    /// One contiguous band of interior rows per worker
    #[default]
    Static,
    /// Bands of `chunk` rows pulled from a shared counter
    Dynamic { chunk: usize },
    /// Bands shrinking as `ceil(remaining / workers)`, never below `min_chunk`
    Guided { min_chunk: usize },
    /// `tile x tile` blocks, assigned statically or dynamically
    Tiled { tile: usize, assignment: Dispatch },
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Static => write!(f, "static"),
            Schedule::Dynamic { chunk } => write!(f, "dynamic({chunk})"),
            Schedule::Guided { min_chunk } => write!(f, "guided({min_chunk})"),
            Schedule::Tiled { tile, assignment } => {
                let how = match assignment {
                    Dispatch::Static => "static",
                    Dispatch::Dynamic => "dynamic",
                };
                write!(f, "tiled({tile}x{tile}, {how})")
            }
        }
    }
}

impl Schedule {
    /// Tiled schedule whose working set (both buffers of every field) fits
    /// in `cache_bytes`. The edge is a multiple of 8 cells, at least 8.
    pub fn tiled_for_cache(cache_bytes: usize, fields: usize, assignment: Dispatch) -> Schedule {
        let per_cell = 2 * fields.max(1) * std::mem::size_of::<f64>();
        let edge = ((cache_bytes / per_cell) as f64).sqrt() as usize;
        let tile = (edge / 8 * 8).max(8);
        Schedule::Tiled { tile, assignment }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Schedule::Static => Ok(()),
            Schedule::Dynamic { chunk: 0 } => {
                Err(SolverError::invalid("chunk", 0, "dynamic chunk must be >= 1"))
            }
            Schedule::Guided { min_chunk: 0 } => {
                Err(SolverError::invalid("min_chunk", 0, "guided minimum chunk must be >= 1"))
            }
            Schedule::Tiled { tile: 0, .. } => {
                Err(SolverError::invalid("tile", 0, "tile edge must be >= 1"))
            }
            _ => Ok(()),
        }
    }

    // ---- Partitioning ----

    /// Splits the interior of `grid` for `workers` threads.
    pub fn partition(&self, grid: Grid, workers: usize) -> WorkPartition {
        let workers = workers.max(1);
        let rows = grid.interior_rows();
        let cols = grid.interior_cols();
        let band = |r: Range<usize>| WorkUnit {
            rows: r,
            cols: cols.clone(),
        };

        match *self {
            Schedule::Static => {
                let parts = workers.min(rows.len());
                let units = (0..parts)
                    .map(|w| band(offset(balanced_block(w, parts, rows.len()), rows.start)))
                    .collect();
                WorkPartition::trusted(grid, units, Dispatch::Static)
            }
            Schedule::Dynamic { chunk } => {
                let chunk = chunk.max(1);
                let units = rows
                    .clone()
                    .step_by(chunk)
                    .map(|start| band(start..start.saturating_add(chunk).min(rows.end)))
                    .collect();
                WorkPartition::trusted(grid, units, Dispatch::Dynamic)
            }
            Schedule::Guided { min_chunk } => {
                let mut units = Vec::new();
                let mut start = rows.start;
                while start < rows.end {
                    let remaining = rows.end - start;
                    let size = remaining.div_ceil(workers).max(min_chunk).min(remaining);
                    units.push(band(start..start + size));
                    start += size;
                }
                WorkPartition::trusted(grid, units, Dispatch::Dynamic)
            }
            Schedule::Tiled { tile, assignment } => {
                let tile = tile.max(1);
                let mut units = Vec::new();
                for i0 in rows.clone().step_by(tile) {
                    for j0 in cols.clone().step_by(tile) {
                        units.push(WorkUnit {
                            rows: i0..i0.saturating_add(tile).min(rows.end),
                            cols: j0..j0.saturating_add(tile).min(cols.end),
                        });
                    }
                }
                WorkPartition::trusted(grid, units, assignment)
            }
        }
    }
}

// first `len % parts` blocks are one longer
fn balanced_block(w: usize, parts: usize, len: usize) -> Range<usize> {
    let base = len / parts;
    let extra = len % parts;
    let start = w * base + w.min(extra);
    let size = base + usize::from(w < extra);
    start..start + size
}

fn offset(r: Range<usize>, by: usize) -> Range<usize> {
    r.start + by..r.end + by
}

/// One update's work: units that tile the interior of `grid` exactly once
#[derive(Clone, Debug)]
pub struct WorkPartition {
    grid: Grid,
    units: Vec<WorkUnit>,
    dispatch: Dispatch,
}

impl WorkPartition {
    /// Hand-built partition; rejected unless `units` cover the interior of
    /// `grid` exactly once.
    pub fn new(
        grid: Grid,
        units: Vec<WorkUnit>,
        dispatch: Dispatch,
    ) -> std::result::Result<WorkPartition, PartitionCoverageError> {
        let partition = WorkPartition::trusted(grid, units, dispatch);
        partition.check_coverage()?;
        Ok(partition)
    }

    fn trusted(grid: Grid, units: Vec<WorkUnit>, dispatch: Dispatch) -> WorkPartition {
        WorkPartition { grid, units, dispatch }
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn static_share(&self, worker: usize, workers: usize) -> Range<usize> {
        balanced_block(worker, workers.max(1), self.units.len())
    }

    /// Runs `work(unit_id, unit)` for every unit, once, as a single parallel
    /// region on `pool`. Returns after every worker has finished.
    pub fn execute<F>(&self, pool: &ThreadPool, work: F)
    where
        F: Fn(usize, &WorkUnit) + Sync,
    {
        match self.dispatch {
            Dispatch::Static => {
                pool.broadcast(|ctx| {
                    for id in self.static_share(ctx.index(), ctx.num_threads()) {
                        work(id, &self.units[id]);
                    }
                });
            }
            Dispatch::Dynamic => {
                let cursor = AtomicUsize::new(0);
                pool.broadcast(|_| {
                    loop {
                        let id = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(unit) = self.units.get(id) else {
                            break;
                        };
                        work(id, unit);
                    }
                });
            }
        }
    }

    pub fn check_coverage(&self) -> std::result::Result<(), PartitionCoverageError> {
        let grid = self.grid;
        let mut owner: Vec<Option<usize>> = vec![None; grid.len()];
        for (id, unit) in self.units.iter().enumerate() {
            if unit.is_empty() {
                continue;
            }
            for i in unit.rows.clone() {
                for j in unit.cols.clone() {
                    if i >= grid.rows() || j >= grid.cols() || grid.is_perimeter(i, j) {
                        return Err(PartitionCoverageError::OutsideInterior { unit: id, row: i, col: j });
                    }
                    let slot = &mut owner[grid.index(i, j)];
                    if let Some(first) = *slot {
                        return Err(PartitionCoverageError::Overlap {
                            row: i,
                            col: j,
                            first,
                            second: id,
                        });
                    }
                    *slot = Some(id);
                }
            }
        }
        for i in grid.interior_rows() {
            for j in grid.interior_cols() {
                if owner[grid.index(i, j)].is_none() {
                    return Err(PartitionCoverageError::Uncovered { row: i, col: j });
                }
            }
        }
        Ok(())
    }
}

/// Units that do not tile the interior exactly
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionCoverageError {
    #[error("unit {unit} reaches ({row}, {col}) outside the interior")]
    OutsideInterior { unit: usize, row: usize, col: usize },

    #[error("cell ({row}, {col}) assigned to units {first} and {second}")]
    Overlap {
        row: usize,
        col: usize,
        first: usize,
        second: usize,
    },

    #[error("cell ({row}, {col}) is not assigned to any unit")]
    Uncovered { row: usize, col: usize },
}
