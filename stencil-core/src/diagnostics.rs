// Parallel reductions: last bits may vary with the thread count.

use rayon::prelude::*;

use crate::field::Field;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Diagnostics {
    /// Completed iterations when the sample was taken
    pub iteration: usize,
    pub kinetic_energy: f64,
    pub max_divergence: f64,
}

impl Diagnostics {
    pub fn sample(iteration: usize, fields: &[Field]) -> Diagnostics {
        let max_divergence = match fields {
            [u, v, ..] => max_divergence(u, v),
            _ => 0.0,
        };
        Diagnostics {
            iteration,
            kinetic_energy: kinetic_energy(fields),
            max_divergence,
        }
    }
}

/// `0.5 * sum(u^2 + v^2 + ...)` averaged over the grid
pub fn kinetic_energy(fields: &[Field]) -> f64 {
    let Some(first) = fields.first() else {
        return 0.0;
    };
    let energy: f64 = fields
        .iter()
        .map(|f| f.current().par_iter().map(|x| x * x).sum::<f64>())
        .sum();
    0.5 * energy / first.grid().len() as f64
}

/// Largest `|du/di + dv/dj|` over the interior, central differences
pub fn max_divergence(u: &Field, v: &Field) -> f64 {
    let grid = u.grid();
    let (u, v) = (u.current(), v.current());
    let cols = grid.cols();
    grid.interior_rows()
        .into_par_iter()
        .map(|i| {
            grid.interior_cols()
                .map(|j| {
                    let idx = i * cols + j;
                    let div = (u[idx + cols] - u[idx - cols]) / 2.0 + (v[idx + 1] - v[idx - 1]) / 2.0;
                    div.abs()
                })
                .fold(0.0, f64::max)
        })
        .reduce(|| 0.0, f64::max)
}

/// Sum of every cell of `current`
pub fn total_mass(field: &Field) -> f64 {
    field.current().iter().sum()
}

pub fn peak(field: &Field) -> f64 {
    field.current().iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub fn all_finite(field: &Field) -> bool {
    field.current().par_iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Grid;

    #[test]
    fn energy_of_constant_flow() {
        let grid = Grid::square(4).unwrap();
        let mut u = Field::allocate("u", grid).unwrap();
        let mut v = Field::allocate("v", grid).unwrap();
        u.fill(1.0);
        v.fill(0.5);
        let fields = [u, v];
        assert!((kinetic_energy(&fields) - 0.625).abs() < 1e-15);
        assert_eq!(max_divergence(&fields[0], &fields[1]), 0.0);
    }

    #[test]
    fn divergence_of_linear_ramp() {
        let grid = Grid::square(6).unwrap();
        let mut u = Field::allocate("u", grid).unwrap();
        let v = Field::allocate("v", grid).unwrap();
        for i in 0..6 {
            for j in 0..6 {
                u.current_mut()[grid.index(i, j)] = 3.0 * i as f64;
            }
        }
        assert_eq!(max_divergence(&u, &v), 3.0);

        let d = Diagnostics::sample(7, std::slice::from_ref(&u));
        assert_eq!(d.iteration, 7);
        assert_eq!(d.max_divergence, 0.0);
    }

    #[test]
    fn mass_peak_and_finiteness() {
        let grid = Grid::square(5).unwrap();
        let mut f = Field::allocate("u", grid).unwrap();
        f.current_mut()[12] = 4.0;
        f.current_mut()[3] = -1.0;
        assert_eq!(total_mass(&f), 3.0);
        assert_eq!(peak(&f), 4.0);
        assert!(all_finite(&f));
        f.current_mut()[0] = f64::NAN;
        assert!(!all_finite(&f));
    }
}
