use rayon::prelude::*;

use crate::field::{Field, Grid};

/// Shape of the initial disturbance, scaled per field by its amplitude
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Perturbation {
    /// Field at rest
    Still,
    /// Every cell at the amplitude
    Uniform,
    /// `exp(-4 r^2 / radius^2)` inside `radius` of the centre, zero outside
    Gaussian { radius: f64 },
    /// Cells within `half_width` (Chebyshev distance) of the centre
    Square { half_width: usize },
}

impl Perturbation {
    /// Gaussian bump with radius an eighth of the shorter side
    pub fn gaussian_for(grid: Grid) -> Perturbation {
        let radius = (grid.rows().min(grid.cols()) / 8).max(1);
        Perturbation::Gaussian {
            radius: radius as f64,
        }
    }

    /// Unscaled value at `(i, j)`, in `[0, 1]`
    pub fn profile(&self, grid: Grid, i: usize, j: usize) -> f64 {
        let (ci, cj) = grid.center();
        match *self {
            Perturbation::Still => 0.0,
            Perturbation::Uniform => 1.0,
            Perturbation::Gaussian { radius } => {
                let di = i as f64 - ci as f64;
                let dj = j as f64 - cj as f64;
                let r2 = di * di + dj * dj;
                if r2 <= radius * radius {
                    (-r2 * 4.0 / (radius * radius)).exp()
                } else {
                    0.0
                }
            }
            Perturbation::Square { half_width } => {
                if i.abs_diff(ci) <= half_width && j.abs_diff(cj) <= half_width {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Overwrites `field.current()` with `amplitude * profile`.
    pub fn seed(&self, field: &mut Field, amplitude: f64) {
        let grid = field.grid();
        match self {
            Perturbation::Still => field.fill(0.0),
            Perturbation::Uniform => field.fill(amplitude),
            _ => field
                .current_mut()
                .par_chunks_mut(grid.cols())
                .enumerate()
                .for_each(|(i, row)| {
                    for (j, cell) in row.iter_mut().enumerate() {
                        *cell = amplitude * self.profile(grid, i, j);
                    }
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_peaks_at_centre_and_is_truncated() {
        let grid = Grid::square(64).unwrap();
        let bump = Perturbation::Gaussian { radius: 8.0 };
        assert_eq!(bump.profile(grid, 32, 32), 1.0);
        assert!((bump.profile(grid, 32, 40) - (-4.0f64).exp()).abs() < 1e-15);
        assert_eq!(bump.profile(grid, 32, 41), 0.0);
        assert!(bump.profile(grid, 30, 31) < 1.0);
        assert_eq!(Perturbation::gaussian_for(grid), bump);
    }

    #[test]
    fn square_and_uniform_seed() {
        let grid = Grid::square(11).unwrap();
        let mut field = Field::allocate("u", grid).unwrap();

        Perturbation::Square { half_width: 1 }.seed(&mut field, 2.0);
        let lit = field.current().iter().filter(|&&x| x == 2.0).count();
        assert_eq!(lit, 9);
        assert_eq!(field.get(4, 4), 2.0);
        assert_eq!(field.get(3, 5), 0.0);

        Perturbation::Uniform.seed(&mut field, 0.5);
        assert!(field.current().iter().all(|&x| x == 0.5));

        Perturbation::Still.seed(&mut field, 0.5);
        assert!(field.current().iter().all(|&x| x == 0.0));
    }
}
