use rayon::prelude::*;

use crate::field::Field;

/// Boundary policy enforced on the grid perimeter
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoundarySpec {
    /// Every perimeter cell pinned to a constant
    Dirichlet(f64),
}

impl Default for BoundarySpec {
    fn default() -> Self {
        BoundarySpec::Dirichlet(0.0)
    }
}

/// Writes the boundary values into `field`'s current buffer.
pub fn apply(field: &mut Field, spec: BoundarySpec) {
    let BoundarySpec::Dirichlet(value) = spec;
    let grid = field.grid();
    let (rows, cols) = (grid.rows(), grid.cols());

    let buf = field.current_mut();
    let (top, rest) = buf.split_at_mut(cols);
    let (middle, bottom) = rest.split_at_mut((rows - 2) * cols);

    // corners belong to the row task
    rayon::join(
        || {
            top.fill(value);
            bottom.fill(value);
        },
        || {
            middle.par_chunks_mut(cols).for_each(|row| {
                row[0] = value;
                row[cols - 1] = value;
            });
        },
    );
}

/// Applies `spec` to every field.
pub fn apply_all(fields: &mut [Field], spec: BoundarySpec) {
    fields.par_iter_mut().for_each(|f| apply(f, spec));
}

/// True when every perimeter cell of `field.current()` holds the boundary value.
pub fn holds(field: &Field, spec: BoundarySpec) -> bool {
    let BoundarySpec::Dirichlet(value) = spec;
    let grid = field.grid();
    let buf = field.current();
    (0..grid.rows()).all(|i| {
        (0..grid.cols())
            .filter(|&j| grid.is_perimeter(i, j))
            .all(|j| buf[grid.index(i, j)] == value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Grid;

    #[test]
    fn zero_dirichlet_clears_perimeter_only() {
        let grid = Grid::new(6, 9).unwrap();
        let mut field = Field::allocate("u", grid).unwrap();
        field.fill(3.0);

        apply(&mut field, BoundarySpec::default());

        for i in 0..grid.rows() {
            for j in 0..grid.cols() {
                let expected = if grid.is_perimeter(i, j) { 0.0 } else { 3.0 };
                assert_eq!(field.get(i, j), expected, "cell ({i}, {j})");
            }
        }
        assert!(holds(&field, BoundarySpec::default()));
    }

    #[test]
    fn constant_boundary_on_smallest_grid() {
        let grid = Grid::square(3).unwrap();
        let mut field = Field::allocate("u", grid).unwrap();
        field.fill(-1.0);

        apply(&mut field, BoundarySpec::Dirichlet(2.5));

        assert_eq!(field.get(1, 1), -1.0);
        assert_eq!(field.get(0, 0), 2.5);
        assert_eq!(field.get(2, 2), 2.5);
        assert_eq!(field.get(1, 0), 2.5);
        assert!(holds(&field, BoundarySpec::Dirichlet(2.5)));
        assert!(!holds(&field, BoundarySpec::default()));
    }
}
