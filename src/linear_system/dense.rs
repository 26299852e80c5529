use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, FullPivLU};

use super::LinearSystem;
use crate::error::{FemError, Result};

/// Pivot ratio below which a factorization is treated as rank deficient
pub const SINGULAR_PIVOT_RATIO: f64 = 1e-12;

/// Factorization used by [`DenseLinearSystem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factorization {
    /// Cholesky, falling back to full-pivot LU when the matrix is not
    /// positive definite but still nonsingular (multiplier-augmented systems)
    Auto,
    /// Cholesky only, rejecting anything that is not positive definite
    Cholesky,
    /// Full-pivot LU
    Lu,
}

enum FactorKind {
    Cholesky(Cholesky<f64, Dyn>),
    Lu(FullPivLU<f64, Dyn, Dyn>),
}

/// Factorization of the equilibrated matrix `S A S`, with `S = diag(scale)`
struct DenseFactor {
    scale: DVector<f64>,
    kind: FactorKind,
}

impl DenseFactor {
    fn solve(&self, b: &DVector<f64>) -> Option<DVector<f64>> {
        let scaled_b = b.component_mul(&self.scale);
        let y = match &self.kind {
            FactorKind::Cholesky(c) => c.solve(&scaled_b),
            FactorKind::Lu(lu) => lu.solve(&scaled_b)?,
        };
        Some(y.component_mul(&self.scale))
    }
}

/// Default backend: dense nalgebra storage and direct factorization.
///
/// Adequate for small and medium systems; memory grows with the square of
/// the system order for every matrix slot.
pub struct DenseLinearSystem {
    order: usize,
    factorization: Factorization,
    matrices: Vec<Option<DMatrix<f64>>>,
    vectors: Vec<Option<DVector<f64>>>,
    solutions: Vec<Option<DVector<f64>>>,
    factors: Vec<Option<DenseFactor>>,
}

impl Default for DenseLinearSystem {
    fn default() -> Self {
        DenseLinearSystem::new(Factorization::Auto)
    }
}

/// Ratio of the smallest to the largest absolute pivot
fn pivot_ratio<'a>(pivots: impl Iterator<Item = &'a f64>) -> f64 {
    let (min, max) = pivots.fold((f64::INFINITY, 0.0_f64), |(min, max), p| {
        (min.min(p.abs()), max.max(p.abs()))
    });
    if max == 0.0 {
        0.0
    } else {
        min / max
    }
}

/// Symmetric scaling giving `S A S` a unit diagonal.
///
/// Rows with a zero diagonal (Lagrange multipliers) are scaled so their
/// largest scaled entry is one. Pivot ratios of the scaled matrix do not
/// depend on the units of the original one.
fn equilibration(m: &DMatrix<f64>) -> DVector<f64> {
    let n = m.nrows();
    let has_diagonal = |i: usize| m[(i, i)] != 0.0;
    let mut scale = DVector::from_fn(n, |i, _| {
        if has_diagonal(i) {
            1.0 / m[(i, i)].abs().sqrt()
        } else {
            0.0
        }
    });
    for i in (0..n).filter(|&i| !has_diagonal(i)) {
        let largest = (0..n)
            .filter(|&j| has_diagonal(j))
            .map(|j| m[(i, j)].abs() * scale[j])
            .fold(0.0, f64::max);
        scale[i] = if largest > 0.0 { 1.0 / largest } else { 1.0 };
    }
    scale
}

fn is_symmetric(m: &DMatrix<f64>) -> bool {
    let scale = m.amax().max(f64::MIN_POSITIVE);
    for i in 0..m.nrows() {
        for j in (i + 1)..m.ncols() {
            if (m[(i, j)] - m[(j, i)]).abs() > 1e-12 * scale {
                return false;
            }
        }
    }
    true
}

impl DenseLinearSystem {
    pub fn new(factorization: Factorization) -> DenseLinearSystem {
        DenseLinearSystem {
            order: 0,
            factorization,
            matrices: Vec::new(),
            vectors: Vec::new(),
            solutions: Vec::new(),
            factors: Vec::new(),
        }
    }

    pub fn factorization(&self) -> Factorization {
        self.factorization
    }

    fn matrix_mut(&mut self, index: usize) -> &mut DMatrix<f64> {
        self.factors[index] = None;
        let order = self.order;
        self.matrices[index].get_or_insert_with(|| DMatrix::zeros(order, order))
    }

    fn vector_mut(&mut self, index: usize) -> &mut DVector<f64> {
        let order = self.order;
        self.vectors[index].get_or_insert_with(|| DVector::zeros(order))
    }

    fn factor_lu(matrix: DMatrix<f64>) -> Result<FactorKind> {
        let lu = matrix.full_piv_lu();
        let ratio = pivot_ratio(lu.u().diagonal().iter());
        if ratio < SINGULAR_PIVOT_RATIO {
            return Err(FemError::SingularSystem(format!(
                "LU pivot ratio {:e} indicates a rank deficient matrix",
                ratio
            )));
        }
        Ok(FactorKind::Lu(lu))
    }

    fn checked_cholesky(chol: Cholesky<f64, Dyn>) -> Result<FactorKind> {
        let ratio = pivot_ratio(chol.l_dirty().diagonal().iter()).powi(2);
        if ratio < SINGULAR_PIVOT_RATIO {
            return Err(FemError::SingularSystem(format!(
                "Cholesky pivot ratio {:e} indicates a singular matrix (unconstrained rigid body mode?)",
                ratio
            )));
        }
        Ok(FactorKind::Cholesky(chol))
    }
}

impl LinearSystem for DenseLinearSystem {
    fn name(&self) -> &str {
        "dense"
    }

    fn system_order(&self) -> usize {
        self.order
    }

    fn set_system_order(&mut self, order: usize) {
        self.order = order;
        self.clear();
    }

    fn set_number_of_matrices(&mut self, count: usize) {
        self.matrices = (0..count).map(|_| None).collect();
        self.factors = (0..count).map(|_| None).collect();
    }

    fn set_number_of_vectors(&mut self, count: usize) {
        self.vectors = vec![None; count];
    }

    fn set_number_of_solutions(&mut self, count: usize) {
        self.solutions = vec![None; count];
    }

    fn initialize_matrix(&mut self, index: usize) {
        self.matrices[index] = Some(DMatrix::zeros(self.order, self.order));
        self.factors[index] = None;
    }

    fn initialize_vector(&mut self, index: usize) {
        self.vectors[index] = Some(DVector::zeros(self.order));
    }

    fn initialize_solution(&mut self, index: usize) {
        self.solutions[index] = Some(DVector::zeros(self.order));
    }

    fn is_matrix_initialized(&self, index: usize) -> bool {
        self.matrices[index].is_some()
    }

    fn is_vector_initialized(&self, index: usize) -> bool {
        self.vectors[index].is_some()
    }

    fn is_solution_initialized(&self, index: usize) -> bool {
        self.solutions[index].is_some()
    }

    fn destroy_matrix(&mut self, index: usize) {
        self.matrices[index] = None;
        self.factors[index] = None;
    }

    fn destroy_vector(&mut self, index: usize) {
        self.vectors[index] = None;
    }

    fn matrix_value(&self, row: usize, col: usize, index: usize) -> f64 {
        match &self.matrices[index] {
            Some(m) => m[(row, col)],
            None => 0.0,
        }
    }

    fn set_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize) {
        self.matrix_mut(index)[(row, col)] = value;
    }

    fn add_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize) {
        self.matrix_mut(index)[(row, col)] += value;
    }

    fn nonzero_columns_in_row(&self, row: usize, index: usize) -> Vec<usize> {
        match &self.matrices[index] {
            Some(m) => (0..self.order).filter(|&c| m[(row, c)] != 0.0).collect(),
            None => Vec::new(),
        }
    }

    fn vector_value(&self, row: usize, index: usize) -> f64 {
        match &self.vectors[index] {
            Some(v) => v[row],
            None => 0.0,
        }
    }

    fn set_vector_value(&mut self, row: usize, value: f64, index: usize) {
        self.vector_mut(index)[row] = value;
    }

    fn add_vector_value(&mut self, row: usize, value: f64, index: usize) {
        self.vector_mut(index)[row] += value;
    }

    fn solution_value(&self, row: usize, index: usize) -> f64 {
        match &self.solutions[index] {
            Some(s) => s[row],
            None => 0.0,
        }
    }

    fn copy_matrix(&mut self, from: usize, to: usize) {
        self.matrices[to] = self.matrices[from].clone();
        self.factors[to] = None;
    }

    fn swap_matrices(&mut self, a: usize, b: usize) {
        self.matrices.swap(a, b);
        self.factors.swap(a, b);
    }

    fn swap_vectors(&mut self, a: usize, b: usize) {
        self.vectors.swap(a, b);
    }

    fn decompose(&mut self, index: usize) -> Result<()> {
        let original = match &self.matrices[index] {
            Some(m) => m.clone(),
            None => DMatrix::zeros(self.order, self.order),
        };
        let scale = equilibration(&original);
        let matrix = DMatrix::from_fn(self.order, self.order, |i, j| {
            scale[i] * original[(i, j)] * scale[j]
        });

        let kind = match self.factorization {
            Factorization::Cholesky => match Cholesky::new(matrix) {
                Some(chol) => DenseLinearSystem::checked_cholesky(chol)?,
                None => {
                    return Err(FemError::SingularSystem(
                        "matrix is not positive definite".to_owned(),
                    ))
                }
            },
            Factorization::Lu => DenseLinearSystem::factor_lu(matrix)?,
            Factorization::Auto => {
                if !is_symmetric(&matrix) {
                    debug!("matrix {} is not symmetric, using LU", index);
                    DenseLinearSystem::factor_lu(matrix)?
                } else {
                    match Cholesky::new(matrix.clone()) {
                        Some(chol) => DenseLinearSystem::checked_cholesky(chol)?,
                        None => {
                            debug!("matrix {} is indefinite, falling back to LU", index);
                            DenseLinearSystem::factor_lu(matrix)?
                        }
                    }
                }
            }
        };

        self.factors[index] = Some(DenseFactor { scale, kind });
        Ok(())
    }

    fn solve(&mut self, matrix: usize, vector: usize, solution: usize) -> Result<()> {
        if self.factors[matrix].is_none() {
            self.decompose(matrix)?;
        }

        let b = match &self.vectors[vector] {
            Some(v) => v.clone(),
            None => DVector::zeros(self.order),
        };

        let x = match &self.factors[matrix] {
            Some(factor) => factor.solve(&b),
            None => None,
        };

        match x {
            Some(x) => {
                self.solutions[solution] = Some(x);
                Ok(())
            }
            None => Err(FemError::SingularSystem(format!(
                "unable to solve with matrix {}",
                matrix
            ))),
        }
    }

    fn clear(&mut self) {
        let (m, v, s) = (self.matrices.len(), self.vectors.len(), self.solutions.len());
        self.set_number_of_matrices(m);
        self.set_number_of_vectors(v);
        self.set_number_of_solutions(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_system::contract;
    use approx::assert_relative_eq;

    fn system(entries: &[f64], factorization: Factorization) -> DenseLinearSystem {
        let n = (entries.len() as f64).sqrt() as usize;
        let mut ls = DenseLinearSystem::new(factorization);
        ls.set_number_of_matrices(1);
        ls.set_number_of_vectors(1);
        ls.set_number_of_solutions(1);
        ls.set_system_order(n);
        for i in 0..n {
            for j in 0..n {
                ls.set_matrix_value(i, j, entries[i * n + j], 0);
            }
        }
        ls
    }

    #[test]
    fn shares_backend_contract() {
        contract::storage_roundtrip(&mut DenseLinearSystem::default());
        contract::solves_spd_system(&mut DenseLinearSystem::default());
        contract::solves_spd_system(&mut DenseLinearSystem::new(Factorization::Lu));
    }

    #[test]
    fn rigid_body_mode_is_singular() {
        let mut ls = system(&[2.0, -2.0, -2.0, 2.0], Factorization::Auto);
        assert!(matches!(ls.decompose(0), Err(FemError::SingularSystem(_))));
    }

    #[test]
    fn strict_cholesky_rejects_indefinite() {
        let mut ls = system(&[1.0, 1.0, 1.0, 0.0], Factorization::Cholesky);
        assert!(matches!(ls.decompose(0), Err(FemError::SingularSystem(_))));
    }

    #[test]
    fn auto_solves_saddle_point_system() {
        // k u + l = 0, u = 2
        let mut ls = system(&[3.0, 1.0, 1.0, 0.0], Factorization::Auto);
        ls.set_vector_value(1, 2.0, 0);
        ls.solve(0, 0, 0).unwrap();
        assert_relative_eq!(ls.solution_value(0, 0), 2.0, epsilon = 1e-12);
        assert_relative_eq!(ls.solution_value(1, 0), -6.0, epsilon = 1e-12);
    }

    #[test]
    fn pivot_check_ignores_units() {
        // spring of stiffness 1e13 next to an eliminated row with unit diagonal
        let k = 1e13;
        let mut ls = system(
            &[1.0, 0.0, 0.0, 0.0, 2.0 * k, -k, 0.0, -k, k],
            Factorization::Auto,
        );
        ls.set_vector_value(2, 1.0, 0);
        ls.solve(0, 0, 0).unwrap();
        assert_relative_eq!(ls.solution_value(1, 0), 1.0 / k, max_relative = 1e-12);
        assert_relative_eq!(ls.solution_value(2, 0), 2.0 / k, max_relative = 1e-12);

        // the same stiffness with a multiplier row tying u1 to u2
        let mut ls = system(
            &[2.0 * k, -k, 1.0, -k, k, -1.0, 1.0, -1.0, 0.0],
            Factorization::Auto,
        );
        ls.set_vector_value(1, 1.0, 0);
        ls.solve(0, 0, 0).unwrap();
        // tied nodes move together, so only the first spring stretches
        assert_relative_eq!(ls.solution_value(0, 0), 1.0 / k, max_relative = 1e-9);
        assert_relative_eq!(ls.solution_value(1, 0), 1.0 / k, max_relative = 1e-9);
        assert_relative_eq!(ls.solution_value(2, 0), -1.0, max_relative = 1e-9);
    }

    #[test]
    fn modification_invalidates_factorization() {
        let mut ls = system(&[2.0, 0.0, 0.0, 2.0], Factorization::Auto);
        ls.set_vector_value(0, 2.0, 0);
        ls.decompose(0).unwrap();
        ls.set_matrix_value(0, 0, 4.0, 0);
        ls.solve(0, 0, 0).unwrap();
        assert_relative_eq!(ls.solution_value(0, 0), 0.5);
    }
}
