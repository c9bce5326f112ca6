use std::ops::Range;

use log::debug;
use rayon::prelude::*;

use crate::error::{Result, SolverError};

/// Bytes per cache line the buffers are aligned to
pub const CACHE_LINE: usize = 64;

const LANES: usize = CACHE_LINE / std::mem::size_of::<f64>();

/// Immutable `rows x cols` grid shape, row-major `(i, j) -> i * cols + j`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Grid {
    rows: usize,
    cols: usize,
}

impl Grid {
    pub fn new(rows: usize, cols: usize) -> Result<Grid> {
        if rows < 3 {
            return Err(SolverError::invalid("rows", rows, "grid needs at least 3 rows"));
        }
        if cols < 3 {
            return Err(SolverError::invalid("cols", cols, "grid needs at least 3 columns"));
        }
        if rows.checked_mul(cols).is_none() {
            return Err(SolverError::invalid("cols", cols, "rows * cols overflows"));
        }
        Ok(Grid { rows, cols })
    }

    pub fn square(n: usize) -> Result<Grid> {
        Grid::new(n, n)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn index(&self, i: usize, j: usize) -> usize {
        i * self.cols + j
    }

    /// Row indices `1..rows-1` touched by the stencil
    pub fn interior_rows(&self) -> Range<usize> {
        1..self.rows - 1
    }

    pub fn interior_cols(&self) -> Range<usize> {
        1..self.cols - 1
    }

    pub fn interior_len(&self) -> usize {
        (self.rows - 2) * (self.cols - 2)
    }

    pub fn is_perimeter(&self, i: usize, j: usize) -> bool {
        i == 0 || j == 0 || i == self.rows - 1 || j == self.cols - 1
    }

    pub fn center(&self) -> (usize, usize) {
        (self.rows / 2, self.cols / 2)
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([f64; LANES]);

const ZERO_LINE: CacheLine = CacheLine([0.0; LANES]);

/// Zero-initialised `f64` storage whose first element sits on a cache line
pub struct AlignedBuffer {
    lines: Vec<CacheLine>,
    len: usize,
}

impl AlignedBuffer {
    /// Allocates `len` zeros, or `None` when the allocator refuses. The fill
    /// runs on the current pool in chunks of at least `min_lines` lines so
    /// pages are first touched by the workers that later update them.
    pub fn zeroed(len: usize, min_lines: usize) -> Option<AlignedBuffer> {
        let line_count = len.div_ceil(LANES);
        let mut lines = Vec::new();
        lines.try_reserve_exact(line_count).ok()?;
        lines.par_extend(
            (0..line_count)
                .into_par_iter()
                .with_min_len(min_lines.max(1))
                .map(|_| ZERO_LINE),
        );
        Some(AlignedBuffer { lines, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[f64] {
        // SAFETY: `CacheLine` is `repr(C)` over `[f64; LANES]` with a size
        // equal to its alignment, so the lines form one contiguous run of
        // initialised f64s at least `len` long.
        unsafe { std::slice::from_raw_parts(self.lines.as_ptr().cast::<f64>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        // SAFETY: see `as_slice`; the borrow of `self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.lines.as_mut_ptr().cast::<f64>(), self.len) }
    }

    pub fn as_ptr(&self) -> *const f64 {
        self.lines.as_ptr().cast()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

/// A named scalar quantity with its `current` and `next` buffers
#[derive(Debug)]
pub struct Field {
    name: String,
    grid: Grid,
    current: AlignedBuffer,
    next: AlignedBuffer,
}

impl Field {
    /// Allocates both buffers zeroed. Must be called inside the pool that
    /// will run the updates for the first-touch placement to line up.
    pub fn allocate(name: impl Into<String>, grid: Grid) -> Result<Field> {
        let name = name.into();
        let threads = rayon::current_num_threads().max(1);
        let min_lines = grid.len().div_ceil(LANES) / threads;

        let alloc_err = || SolverError::Allocation {
            fields: 1,
            rows: grid.rows(),
            cols: grid.cols(),
        };
        let current = AlignedBuffer::zeroed(grid.len(), min_lines).ok_or_else(alloc_err)?;
        let next = AlignedBuffer::zeroed(grid.len(), min_lines).ok_or_else(alloc_err)?;

        debug!(
            "allocated field {:?}: {}x{} ({} bytes per buffer)",
            name,
            grid.rows(),
            grid.cols(),
            grid.len() * std::mem::size_of::<f64>()
        );
        Ok(Field {
            name,
            grid,
            current,
            next,
        })
    }

    /// Bytes both buffers of one field take on `grid`
    pub fn footprint(grid: Grid) -> usize {
        2 * grid.len().div_ceil(LANES) * CACHE_LINE
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn current(&self) -> &[f64] {
        self.current.as_slice()
    }

    pub fn current_mut(&mut self) -> &mut [f64] {
        self.current.as_mut_slice()
    }

    pub fn next(&self) -> &[f64] {
        self.next.as_slice()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.current()[self.grid.index(i, j)]
    }

    /// Exchanges the buffer handles; no element is copied.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }

    /// Reads from `current` while writing into `next`.
    pub fn split(&mut self) -> (&[f64], &mut [f64]) {
        (self.current.as_slice(), self.next.as_mut_slice())
    }

    /// Overwrites `current` with row-major `values`.
    pub fn load(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.grid.len() {
            return Err(SolverError::FieldLength {
                expected: self.grid.len(),
                found: values.len(),
            });
        }
        self.current_mut().copy_from_slice(values);
        Ok(())
    }

    pub fn fill(&mut self, value: f64) {
        self.current_mut().fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_rejects_degenerate_shapes() {
        assert!(Grid::new(2, 10).is_err());
        assert!(Grid::new(10, 2).is_err());
        assert!(Grid::new(3, 3).is_ok());
    }

    #[test]
    fn grid_interior_excludes_perimeter() {
        let g = Grid::new(5, 7).unwrap();
        assert_eq!(g.interior_rows(), 1..4);
        assert_eq!(g.interior_cols(), 1..6);
        assert_eq!(g.interior_len(), 15);
        assert!(g.is_perimeter(0, 3));
        assert!(g.is_perimeter(4, 3));
        assert!(g.is_perimeter(2, 6));
        assert!(!g.is_perimeter(2, 3));
    }

    #[test]
    fn buffers_are_zeroed_and_aligned() {
        let field = Field::allocate("u", Grid::new(13, 11).unwrap()).unwrap();
        for buf in [field.current(), field.next()] {
            assert_eq!(buf.len(), 143);
            assert!(buf.iter().all(|&x| x == 0.0));
            assert_eq!(buf.as_ptr() as usize % CACHE_LINE, 0);
        }
    }

    #[test]
    fn impossible_allocation_is_reported_not_aborted() {
        assert!(AlignedBuffer::zeroed(usize::MAX, 1).is_none());
        assert!(AlignedBuffer::zeroed(usize::MAX / 2, 4).is_none());
        assert_eq!(AlignedBuffer::zeroed(0, 1).map(|b| b.len()), Some(0));
    }

    #[test]
    fn footprint_counts_whole_cache_lines() {
        assert_eq!(Field::footprint(Grid::square(8).unwrap()), 2 * 8 * CACHE_LINE);
        assert_eq!(Field::footprint(Grid::new(3, 3).unwrap()), 2 * 2 * CACHE_LINE);
    }

    #[test]
    fn swap_exchanges_handles_without_copying() {
        let mut field = Field::allocate("u", Grid::square(8).unwrap()).unwrap();
        field.current_mut()[9] = 1.5;
        let cur_ptr = field.current().as_ptr();
        let next_ptr = field.next().as_ptr();

        field.swap();

        assert_eq!(field.current().as_ptr(), next_ptr);
        assert_eq!(field.next().as_ptr(), cur_ptr);
        assert_eq!(field.next()[9], 1.5);
        assert_eq!(field.current()[9], 0.0);
    }

    #[test]
    fn load_checks_length() {
        let mut field = Field::allocate("v", Grid::square(4).unwrap()).unwrap();
        assert!(matches!(
            field.load(&[1.0; 15]),
            Err(SolverError::FieldLength { expected: 16, found: 15 })
        ));
        field.load(&[2.0; 16]).unwrap();
        assert_eq!(field.get(3, 3), 2.0);
    }
}
