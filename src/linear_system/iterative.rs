use std::collections::BTreeMap;

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        ArgminFloat, Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};
use indicatif::ProgressBar;
use log::{debug, info};
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use super::LinearSystem;
use crate::error::{FemError, Result};

pub const DEFAULT_CG_TOLERANCE: f64 = 1e-10;
pub const DEFAULT_MAX_CG_ITER: u64 = 100_000;

type SparseRows = Vec<BTreeMap<usize, f64>>;

/// Runs multiplication for the Conjugate Gradient solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let x = DVector::from_column_slice(x);
        let y: DVector<f64> = self.a * &x;
        Ok(y.as_slice().to_vec())
    }
}

/// Progress bar driven by the residual's approach to the target cost
struct ConjugateGradientObserverBar {
    bar: ProgressBar,
    target_mag: f64,
    initial_mag: Option<f64>,
}

impl ConjugateGradientObserverBar {
    fn new(target_cost: f64) -> ConjugateGradientObserverBar {
        ConjugateGradientObserverBar {
            bar: ProgressBar::new(1000),
            target_mag: target_cost.log10(),
            initial_mag: None,
        }
    }

    fn argmin_float_to_f64<F: ArgminFloat>(&self, value: F) -> Option<f64> {
        // ArgminFloat exposes no direct conversion without pulling num-traits in
        format!("{:?}", value).parse().ok()
    }
}

impl<I> Observe<I> for ConjugateGradientObserverBar
where
    I: State,
{
    fn observe_init(&mut self, _name: &str, _state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        let cost = match self.argmin_float_to_f64(state.get_cost()) {
            Some(c) if c > 0.0 && c.is_finite() => c,
            _ => return Ok(()),
        };
        let cost_mag = cost.log10();
        let initial_mag = *self.initial_mag.get_or_insert(cost_mag);
        let span = (initial_mag - self.target_mag).max(f64::EPSILON);
        let progress = (1000. * (initial_mag - cost_mag) / span).clamp(0., 1000.) as u64;
        self.bar.set_position(progress);

        Ok(())
    }

    fn observe_final(&mut self, _state: &I) -> std::result::Result<(), Error> {
        self.bar.finish_and_clear();
        Ok(())
    }
}

/// Sparse backend solved with the conjugate gradient method.
///
/// Matrices are stored as ordered sparse rows and converted to CSR when
/// decomposed. Only symmetric positive definite systems are supported, so
/// multi-freedom constraints must use the penalty strategy with this backend.
pub struct ConjugateGradientSystem {
    order: usize,
    /// Relative residual `|Ax - b| / |b|` at which iteration stops
    pub tolerance: f64,
    pub max_iterations: u64,
    pub show_progress: bool,
    matrices: Vec<Option<SparseRows>>,
    snapshots: Vec<Option<CsrMatrix<f64>>>,
    vectors: Vec<Option<DVector<f64>>>,
    solutions: Vec<Option<DVector<f64>>>,
}

impl Default for ConjugateGradientSystem {
    fn default() -> Self {
        ConjugateGradientSystem::new(DEFAULT_CG_TOLERANCE, DEFAULT_MAX_CG_ITER)
    }
}

impl ConjugateGradientSystem {
    pub fn new(tolerance: f64, max_iterations: u64) -> ConjugateGradientSystem {
        ConjugateGradientSystem {
            order: 0,
            tolerance,
            max_iterations,
            show_progress: false,
            matrices: Vec::new(),
            snapshots: Vec::new(),
            vectors: Vec::new(),
            solutions: Vec::new(),
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> ConjugateGradientSystem {
        self.show_progress = show_progress;
        self
    }

    fn rows_mut(&mut self, index: usize) -> &mut SparseRows {
        self.snapshots[index] = None;
        let order = self.order;
        self.matrices[index].get_or_insert_with(|| vec![BTreeMap::new(); order])
    }

    fn vector_mut(&mut self, index: usize) -> &mut DVector<f64> {
        let order = self.order;
        self.vectors[index].get_or_insert_with(|| DVector::zeros(order))
    }

    /// Solves a system of equations using the conjugate gradient method.
    ///
    /// # Arguments
    /// * `a` - A square positive definite matrix
    /// * `b` - The right-hand side of the system
    ///
    /// # Returns
    /// An approximation of `x` in `Ax=b`
    fn run_conjugate_gradient(&self, a: &CsrMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let b_norm = b.norm();
        if b_norm == 0.0 {
            return Ok(DVector::zeros(b.nrows()));
        }

        let b_flat: Vec<f64> = b.iter().copied().collect();
        let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
        let initial_guess: Vec<f64> = vec![0.0; b.nrows()];
        let target_cost = self.tolerance * b_norm;

        let operator = ConjugateGradientOperator { a };
        let mut executor = Executor::new(operator, solver).configure(|state| {
            state
                .param(initial_guess)
                .max_iters(self.max_iterations)
                .target_cost(target_cost)
        });
        if self.show_progress {
            executor = executor.add_observer(
                ConjugateGradientObserverBar::new(target_cost),
                ObserverMode::NewBest,
            );
        }

        let res = match executor.run() {
            Ok(r) => r,
            Err(err) => {
                return Err(FemError::SingularSystem(format!(
                    "Conjugate Gradient error: {err}"
                )))
            }
        };

        let iterations = res.state().get_iter();
        let best_param = match &res.state().best_param {
            Some(vec) => DVector::from_vec(vec.clone()),
            None => {
                return Err(FemError::SingularSystem(
                    "Conjugate Gradient could not produce best parameter".to_owned(),
                ))
            }
        };

        let residual = (a * &best_param - b).norm() / b_norm;
        if !residual.is_finite() || residual > 10.0 * self.tolerance.max(f64::EPSILON) {
            return Err(FemError::SingularSystem(format!(
                "Conjugate Gradient stalled at relative residual {:e} after {} iterations",
                residual, iterations
            )));
        }
        debug!(
            "conjugate gradient converged in {} iterations (residual {:e})",
            iterations, residual
        );

        Ok(best_param)
    }
}

impl LinearSystem for ConjugateGradientSystem {
    fn name(&self) -> &str {
        "conjugate gradient"
    }

    fn system_order(&self) -> usize {
        self.order
    }

    fn set_system_order(&mut self, order: usize) {
        self.order = order;
        self.clear();
    }

    fn set_number_of_matrices(&mut self, count: usize) {
        self.matrices = vec![None; count];
        self.snapshots = vec![None; count];
    }

    fn set_number_of_vectors(&mut self, count: usize) {
        self.vectors = vec![None; count];
    }

    fn set_number_of_solutions(&mut self, count: usize) {
        self.solutions = vec![None; count];
    }

    fn initialize_matrix(&mut self, index: usize) {
        self.matrices[index] = Some(vec![BTreeMap::new(); self.order]);
        self.snapshots[index] = None;
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
        self.snapshots[index] = None;
    }

    fn destroy_vector(&mut self, index: usize) {
        self.vectors[index] = None;
    }

    fn matrix_value(&self, row: usize, col: usize, index: usize) -> f64 {
        match &self.matrices[index] {
            Some(rows) => rows[row].get(&col).copied().unwrap_or(0.0),
            None => 0.0,
        }
    }

    fn set_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize) {
        let rows = self.rows_mut(index);
        if value == 0.0 {
            rows[row].remove(&col);
        } else {
            rows[row].insert(col, value);
        }
    }

    fn add_matrix_value(&mut self, row: usize, col: usize, value: f64, index: usize) {
        if value == 0.0 {
            return;
        }
        *self.rows_mut(index)[row].entry(col).or_insert(0.0) += value;
    }

    fn nonzero_columns_in_row(&self, row: usize, index: usize) -> Vec<usize> {
        match &self.matrices[index] {
            Some(rows) => rows[row].keys().copied().collect(),
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
        self.snapshots[to] = None;
    }

    fn swap_matrices(&mut self, a: usize, b: usize) {
        self.matrices.swap(a, b);
        self.snapshots.swap(a, b);
    }

    fn swap_vectors(&mut self, a: usize, b: usize) {
        self.vectors.swap(a, b);
    }

    fn decompose(&mut self, index: usize) -> Result<()> {
        let mut coo = CooMatrix::new(self.order, self.order);
        if let Some(rows) = &self.matrices[index] {
            for (i, row) in rows.iter().enumerate() {
                let diagonal = row.get(&i).copied().unwrap_or(0.0);
                if diagonal <= 0.0 {
                    return Err(FemError::SingularSystem(format!(
                        "row {} has non-positive diagonal {:e}; conjugate gradient needs a positive definite matrix",
                        i, diagonal
                    )));
                }
                for (&j, &value) in row.iter() {
                    coo.push(i, j, value);
                }
            }
        } else if self.order > 0 {
            return Err(FemError::SingularSystem(format!(
                "matrix {} is empty",
                index
            )));
        }

        let csr = CsrMatrix::from(&coo);
        info!(
            "prepared {}x{} sparse matrix with {} stored entries",
            self.order,
            self.order,
            csr.nnz()
        );
        self.snapshots[index] = Some(csr);
        Ok(())
    }

    fn solve(&mut self, matrix: usize, vector: usize, solution: usize) -> Result<()> {
        if self.snapshots[matrix].is_none() {
            self.decompose(matrix)?;
        }

        let b = match &self.vectors[vector] {
            Some(v) => v.clone(),
            None => DVector::zeros(self.order),
        };

        let x = match &self.snapshots[matrix] {
            Some(a) => self.run_conjugate_gradient(a, &b)?,
            None => {
                return Err(FemError::SingularSystem(format!(
                    "matrix {} was not prepared",
                    matrix
                )))
            }
        };

        self.solutions[solution] = Some(x);
        Ok(())
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

    #[test]
    fn shares_backend_contract() {
        contract::storage_roundtrip(&mut ConjugateGradientSystem::default());
        contract::solves_spd_system(&mut ConjugateGradientSystem::default());
    }

    #[test]
    fn zero_entries_are_not_stored() {
        let mut ls = ConjugateGradientSystem::default();
        ls.set_number_of_matrices(1);
        ls.set_system_order(2);
        ls.set_matrix_value(0, 1, 3.0, 0);
        ls.set_matrix_value(0, 1, 0.0, 0);
        assert!(ls.nonzero_columns_in_row(0, 0).is_empty());
    }

    #[test]
    fn rejects_zero_diagonal() {
        let mut ls = ConjugateGradientSystem::default();
        ls.set_number_of_matrices(1);
        ls.set_system_order(2);
        ls.set_matrix_value(0, 0, 1.0, 0);
        ls.set_matrix_value(0, 1, 1.0, 0);
        ls.set_matrix_value(1, 0, 1.0, 0);
        assert!(matches!(ls.decompose(0), Err(FemError::SingularSystem(_))));
    }

    #[test]
    fn zero_rhs_gives_zero_solution() {
        let mut ls = ConjugateGradientSystem::default();
        ls.set_number_of_matrices(1);
        ls.set_number_of_vectors(1);
        ls.set_number_of_solutions(1);
        ls.set_system_order(2);
        ls.set_matrix_value(0, 0, 2.0, 0);
        ls.set_matrix_value(1, 1, 2.0, 0);
        ls.solve(0, 0, 0).unwrap();
        assert_relative_eq!(ls.solution_value(1, 0), 0.0);
    }
}
