//! Pluggable storage and solution of the global linear system.
//!
//! The solver talks to matrices, vectors and solutions only through the
//! [`LinearSystem`] trait, addressing each by a small slot index. Backends
//! decide how entries are stored and how `A x = b` is factorized and solved.
//!
//! - [`DenseLinearSystem`]: nalgebra dense storage with Cholesky or LU
//!   factorization. Used when no other backend is installed.
//! - [`ConjugateGradientSystem`]: sparse row storage solved with argmin's
//!   conjugate gradient. Requires a symmetric positive definite matrix.

pub mod dense;
pub mod iterative;

pub use dense::{DenseLinearSystem, Factorization};
pub use iterative::ConjugateGradientSystem;

use crate::error::Result;

/// Storage and solution of `A x = b` systems.
///
/// Matrices, vectors and solutions live in fixed numbers of slots set with
/// the `set_number_of_*` methods. Every slot has `system_order` rows.
/// Reading an uninitialized slot yields zeros; writing to one initializes it.
/// Indices outside the configured slot counts or system order panic, as
/// plain indexing does.
pub trait LinearSystem {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    fn system_order(&self) -> usize;

    /// Sets the number of rows. Existing storage is discarded.
    fn set_system_order(&mut self, order: usize);

    fn set_number_of_matrices(&mut self, count: usize);
    fn set_number_of_vectors(&mut self, count: usize);
    fn set_number_of_solutions(&mut self, count: usize);

    /// Allocates a zeroed matrix in slot `index`
    fn initialize_matrix(&mut self, index: usize);
    /// Allocates a zeroed vector in slot `index`
    fn initialize_vector(&mut self, index: usize);
    /// Allocates a zeroed solution in slot `index`
    fn initialize_solution(&mut self, index: usize);

    fn is_matrix_initialized(&self, index: usize) -> bool;
    fn is_vector_initialized(&self, index: usize) -> bool;
    fn is_solution_initialized(&self, index: usize) -> bool;

    fn destroy_matrix(&mut self, index: usize);
    fn destroy_vector(&mut self, index: usize);

    fn matrix_value(&self, row: usize, col: usize, index: usize) -> f64;
    fn set_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize);
    fn add_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize);

    /// Columns holding stored (possibly non-zero) entries of a row
    fn nonzero_columns_in_row(&self, row: usize, index: usize) -> Vec<usize>;

    fn vector_value(&self, row: usize, index: usize) -> f64;
    fn set_vector_value(&mut self, row: usize, value: f64, index: usize);
    fn add_vector_value(&mut self, row: usize, value: f64, index: usize);

    fn solution_value(&self, row: usize, index: usize) -> f64;

    /// Overwrites matrix slot `to` with a copy of slot `from`
    fn copy_matrix(&mut self, from: usize, to: usize);
    fn swap_matrices(&mut self, a: usize, b: usize);
    fn swap_vectors(&mut self, a: usize, b: usize);

    /// Factorizes matrix slot `index` so later solves can reuse it
    fn decompose(&mut self, index: usize) -> Result<()>;

    /// Solves `matrix * solution = vector`, factorizing `matrix` first if it
    /// has not been factorized since its last modification
    fn solve(&mut self, matrix: usize, vector: usize, solution: usize) -> Result<()>;

    /// Drops all storage and factorizations, keeping the slot counts
    fn clear(&mut self);
}

/// Size of the storage slots used by the solver.
pub(crate) const MATRIX_SLOTS: usize = 3;
pub(crate) const VECTOR_SLOTS: usize = 2;

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every backend must share, run against each implementation.

    use super::LinearSystem;
    use approx::assert_relative_eq;

    pub fn storage_roundtrip(ls: &mut dyn LinearSystem) {
        ls.set_number_of_matrices(2);
        ls.set_number_of_vectors(2);
        ls.set_number_of_solutions(1);
        ls.set_system_order(3);

        assert!(!ls.is_matrix_initialized(0));
        assert_eq!(ls.matrix_value(1, 1, 0), 0.0);

        ls.initialize_matrix(0);
        ls.set_matrix_value(0, 0, 2.0, 0);
        ls.add_matrix_value(0, 0, 1.5, 0);
        ls.add_matrix_value(0, 2, -1.0, 0);
        assert!(ls.is_matrix_initialized(0));
        assert_relative_eq!(ls.matrix_value(0, 0, 0), 3.5);
        assert_eq!(ls.nonzero_columns_in_row(0, 0), vec![0, 2]);

        ls.copy_matrix(0, 1);
        ls.set_matrix_value(0, 0, 0.0, 0);
        assert_relative_eq!(ls.matrix_value(0, 0, 1), 3.5);
        ls.swap_matrices(0, 1);
        assert_relative_eq!(ls.matrix_value(0, 0, 0), 3.5);

        ls.initialize_vector(1);
        ls.add_vector_value(2, 4.0, 1);
        ls.swap_vectors(0, 1);
        assert_relative_eq!(ls.vector_value(2, 0), 4.0);
        assert!(!ls.is_vector_initialized(1));

        ls.destroy_matrix(1);
        assert!(!ls.is_matrix_initialized(1));

        ls.clear();
        assert!(!ls.is_matrix_initialized(0));
        assert_eq!(ls.system_order(), 3);
    }

    pub fn solves_spd_system(ls: &mut dyn LinearSystem) {
        ls.set_number_of_matrices(1);
        ls.set_number_of_vectors(1);
        ls.set_number_of_solutions(1);
        ls.set_system_order(3);
        ls.initialize_matrix(0);
        ls.initialize_vector(0);

        let a = [[4.0, -1.0, 0.0], [-1.0, 4.0, -1.0], [0.0, -1.0, 4.0]];
        for (i, row) in a.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                if *v != 0.0 {
                    ls.set_matrix_value(i, j, *v, 0);
                }
            }
        }
        ls.set_vector_value(0, 3.0, 0);
        ls.set_vector_value(1, 2.0, 0);
        ls.set_vector_value(2, 3.0, 0);

        ls.decompose(0).unwrap();
        ls.solve(0, 0, 0).unwrap();
        for i in 0..3 {
            assert_relative_eq!(ls.solution_value(i, 0), 1.0, epsilon = 1e-6);
        }
    }
}
