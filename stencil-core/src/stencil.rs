use std::marker::PhantomData;

use rayon::ThreadPool;

use crate::error::{Result, SolverError};
use crate::field::Field;
use crate::schedule::{WorkPartition, WorkUnit};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StencilParams {
    pub dt: f64,
    /// Diffusion coefficient (kinematic viscosity for velocity fields)
    pub diffusion: f64,
}

impl Default for StencilParams {
    fn default() -> Self {
        StencilParams {
            dt: 1e-5,
            diffusion: 0.1,
        }
    }
}

impl StencilParams {
    pub fn new(dt: f64, diffusion: f64) -> Result<StencilParams> {
        let params = StencilParams { dt, diffusion };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(SolverError::invalid("dt", self.dt, "time step must be finite and > 0"));
        }
        if !(self.diffusion.is_finite() && self.diffusion > 0.0) {
            return Err(SolverError::invalid(
                "diffusion",
                self.diffusion,
                "diffusion coefficient must be finite and > 0",
            ));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn coefficient(&self) -> f64 {
        self.dt * self.diffusion
    }

    /// `4 dt nu / h^2` on a unit-spaced grid; the scheme is stable below 1
    pub fn stability_number(&self) -> f64 {
        4.0 * self.dt * self.diffusion
    }
}

// ---- Kernel: next = c + dt * nu * lap(c), 5-point, unit spacing ----

#[inline(always)]
pub fn laplacian(src: &[f64], idx: usize, cols: usize) -> f64 {
    src[idx - cols] + src[idx + cols] + src[idx - 1] + src[idx + 1] - 4.0 * src[idx]
}

/// Write access to one buffer shared by all workers of a region. Workers
/// only ever ask for spans inside their own work units.
struct DisjointWriter<'a> {
    ptr: *mut f64,
    len: usize,
    _buf: PhantomData<&'a mut [f64]>,
}

// SAFETY: the writer is only used through `span`, whose callers guarantee
// that concurrently requested spans never overlap.
unsafe impl Send for DisjointWriter<'_> {}
unsafe impl Sync for DisjointWriter<'_> {}

impl<'a> DisjointWriter<'a> {
    fn new(buf: &'a mut [f64]) -> Self {
        DisjointWriter {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            _buf: PhantomData,
        }
    }

    /// # Safety
    ///
    /// No other live span may overlap `start..start + len`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn span(&self, start: usize, len: usize) -> &'a mut [f64] {
        assert!(start + len <= self.len);
        // SAFETY: in bounds by the assert; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), len) }
    }
}

#[cfg(all(feature = "prefetch", target_arch = "x86_64"))]
#[inline(always)]
fn prefetch(src: &[f64], idx: usize) {
    use std::arch::x86_64::{_MM_HINT_T1, _mm_prefetch};
    if let Some(p) = src.get(idx) {
        // SAFETY: prefetching an in-bounds address has no side effects.
        unsafe { _mm_prefetch::<_MM_HINT_T1>((p as *const f64).cast::<i8>()) };
    }
}

#[cfg(not(all(feature = "prefetch", target_arch = "x86_64")))]
#[inline(always)]
fn prefetch(_src: &[f64], _idx: usize) {}

#[inline]
fn sweep(src: &[f64], dst: &DisjointWriter<'_>, cols: usize, unit: &WorkUnit, coeff: f64) {
    let width = unit.cols.len();
    for i in unit.rows.clone() {
        let row = i * cols;
        prefetch(src, row + 2 * cols + unit.cols.start);

        // SAFETY: a `WorkPartition` only exists with units tiling its grid's
        // interior once, and `update` checked that grid against the field, so
        // this row span belongs to the calling worker alone.
        let out = unsafe { dst.span(row + unit.cols.start, width) };
        for (cell, j) in out.iter_mut().zip(unit.cols.clone()) {
            let idx = row + j;
            *cell = src[idx] + coeff * laplacian(src, idx, cols);
        }
    }
}

/// Writes the next state of every field's interior into its `next` buffer,
/// running `partition` as one parallel region on `pool`. Every field must
/// live on the grid the partition was built for.
pub fn update(
    fields: &mut [Field],
    params: &StencilParams,
    partition: &WorkPartition,
    pool: &ThreadPool,
) -> Result<()> {
    let grid = partition.grid();
    if let Some(field) = fields.iter().find(|f| f.grid() != grid) {
        return Err(SolverError::GridMismatch {
            field: field.name().to_string(),
            rows: field.grid().rows(),
            cols: field.grid().cols(),
            partition_rows: grid.rows(),
            partition_cols: grid.cols(),
        });
    }

    let cols = grid.cols();
    let coeff = params.coefficient();
    let sweeps: Vec<(&[f64], DisjointWriter<'_>)> = fields
        .iter_mut()
        .map(|f| {
            let (src, dst) = f.split();
            (src, DisjointWriter::new(dst))
        })
        .collect();

    // Fused over fields: each unit is swept for u, v, ... back to back.
    partition.execute(pool, |_, unit| {
        for (src, dst) in &sweeps {
            sweep(src, dst, cols, unit, coeff);
        }
    });
    Ok(())
}
