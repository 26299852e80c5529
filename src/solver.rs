//! Solve orchestration: DOF numbering, assembly, boundary conditions,
//! factorization, back-substitution into the mesh and the interpolation grid.
//!
//! The stages can be driven one by one or all at once with [`Solver::solve`]:
//!
//! ```text
//! assign_dofs -> assemble_k -> { apply_bc(s) -> assemble_f(s) -> decompose_k -> run_solver(s) }
//!             -> update_displacements -> fill_interpolation_grid
//! ```
//!
//! Calls out of order are rejected with [`FemError::OrderingViolation`].

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info};

use crate::{
    assembly::{
        assemble_element_matrices, assemble_landmark_stiffness, assemble_loads, fold_constraints,
        locate_landmarks, select_constraints, LandmarkSite, MfcStrategy,
    },
    constraints::{active_fixed_dofs, implied_by_fixed},
    datatypes::{Configuration, Point},
    dof::DofMap,
    error::{FemError, Result},
    grid::{GridGeometry, InterpolationGrid},
    linear_system::{DenseLinearSystem, LinearSystem, MATRIX_SLOTS, VECTOR_SLOTS},
    mesh::Mesh,
};

/// Matrix slot holding the constrained system that gets factorized
pub const WORKING_MATRIX: usize = 0;
/// Matrix slot holding the element stiffness alone
pub const ELEMENT_MATRIX: usize = 1;
/// Matrix slot holding the full system before boundary conditions
pub const UNCONSTRAINED_MATRIX: usize = 2;
pub const FORCE_VECTOR: usize = 0;
/// Vector slot collecting the load moved over by eliminated DOFs
pub const CORRECTION_VECTOR: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Number of right-hand sides solved against the same stiffness.
    /// Vector elements use one; isotropic scalar elements use one per axis.
    pub solution_sets: usize,
    pub mfc_strategy: MfcStrategy,
    /// Draw indicatif progress bars for the long running stages
    pub show_progress: bool,
    /// Time step for dynamic formulations, stored but unused by statics
    pub time_step: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            solution_sets: 1,
            mfc_strategy: MfcStrategy::default(),
            show_progress: false,
            time_step: 0.0,
        }
    }
}

enum Backend<'a> {
    Owned(DenseLinearSystem),
    Borrowed(&'a mut dyn LinearSystem),
}

impl<'a> Backend<'a> {
    fn get(&mut self) -> &mut dyn LinearSystem {
        match self {
            Backend::Owned(ls) => ls,
            Backend::Borrowed(ls) => &mut **ls,
        }
    }

    fn get_ref(&self) -> &dyn LinearSystem {
        match self {
            Backend::Owned(ls) => ls,
            Backend::Borrowed(ls) => &**ls,
        }
    }
}

/// Boundary conditions applied for one solution set
struct ConstrainedSet {
    set: usize,
    fixed: BTreeMap<usize, f64>,
    /// Multiplier rows whose constraint the fixed DOFs already enforce
    neutralized: Vec<usize>,
}

fn numbering(dof_map: &Option<DofMap>) -> Result<&DofMap> {
    match dof_map {
        Some(map) => Ok(map),
        None => Err(FemError::OrderingViolation(
            "degrees of freedom have not been numbered".to_owned(),
        )),
    }
}

/// Zeroes the rows and columns of `rows` leaving a unit diagonal
fn eliminate_rows(ls: &mut dyn LinearSystem, rows: &[usize], matrix: usize) {
    for &row in rows {
        for col in ls.nonzero_columns_in_row(row, matrix) {
            ls.set_matrix_value(row, col, 0.0, matrix);
            ls.set_matrix_value(col, row, 0.0, matrix);
        }
        ls.set_matrix_value(row, row, 1.0, matrix);
    }
}

/// Drives the assembly and solution of a mesh.
///
/// The mesh is borrowed for the solver's lifetime and receives the solved
/// displacements in place. The linear system backend is either owned (a
/// [`DenseLinearSystem`]) or borrowed from the caller.
pub struct Solver<'a, const D: usize> {
    mesh: &'a mut Mesh<D>,
    backend: Backend<'a>,
    config: SolverConfig,
    dof_map: Option<DofMap>,
    landmarks: Vec<LandmarkSite<D>>,
    /// Indices of the mesh constraints present in the system
    folded: Vec<usize>,
    penalty_weight: f64,
    assembled: bool,
    /// Rows currently eliminated from the working matrix
    applied_pattern: Option<Vec<usize>>,
    constrained: Option<ConstrainedSet>,
    factorized: bool,
    forced_set: Option<usize>,
    solved: Vec<bool>,
    grid: Option<InterpolationGrid<D>>,
}

impl<'a, const D: usize> Solver<'a, D> {
    /// Creates a solver using the default dense backend
    pub fn new(mesh: &'a mut Mesh<D>, config: SolverConfig) -> Solver<'a, D> {
        Solver::build(mesh, Backend::Owned(DenseLinearSystem::default()), config)
    }

    /// Creates a solver running on a caller supplied backend
    pub fn with_backend(
        mesh: &'a mut Mesh<D>,
        backend: &'a mut dyn LinearSystem,
        config: SolverConfig,
    ) -> Solver<'a, D> {
        Solver::build(mesh, Backend::Borrowed(backend), config)
    }

    fn build(mesh: &'a mut Mesh<D>, backend: Backend<'a>, mut config: SolverConfig) -> Solver<'a, D> {
        config.solution_sets = config.solution_sets.max(1);
        let sets = config.solution_sets;
        Solver {
            mesh,
            backend,
            config,
            dof_map: None,
            landmarks: Vec::new(),
            folded: Vec::new(),
            penalty_weight: 0.0,
            assembled: false,
            applied_pattern: None,
            constrained: None,
            factorized: false,
            forced_set: None,
            solved: vec![false; sets],
            grid: None,
        }
    }

    /// Replaces the backend and discards all assembled state
    pub fn set_linear_system(&mut self, backend: &'a mut dyn LinearSystem) {
        self.backend = Backend::Borrowed(backend);
        self.clear();
    }

    pub fn linear_system(&self) -> &dyn LinearSystem {
        self.backend.get_ref()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// The mesh, with displacements once they have been updated
    pub fn mesh(&self) -> &Mesh<D> {
        self.mesh
    }

    pub fn time_step(&self) -> f64 {
        self.config.time_step
    }

    pub fn set_time_step(&mut self, dt: f64) {
        self.config.time_step = dt;
    }

    /// Forgets the numbering and every assembled or solved quantity. The
    /// interpolation grid keeps its geometry.
    pub fn clear(&mut self) {
        self.dof_map = None;
        self.landmarks.clear();
        self.folded.clear();
        self.penalty_weight = 0.0;
        self.assembled = false;
        self.applied_pattern = None;
        self.constrained = None;
        self.factorized = false;
        self.forced_set = None;
        self.solved = vec![false; self.config.solution_sets];
        self.backend.get().clear();
    }

    fn check_set(&self, set: usize) -> Result<()> {
        if set >= self.config.solution_sets {
            return Err(FemError::OutOfRange(format!(
                "solution set {} requested but the solver has {}",
                set, self.config.solution_sets
            )));
        }
        Ok(())
    }

    /// Number of global freedoms, zero before numbering
    pub fn ngfn(&self) -> usize {
        self.dof_map.as_ref().map_or(0, |m| m.ngfn())
    }

    /// Number of constraints folded into the system
    pub fn nmfc(&self) -> usize {
        self.folded.len()
    }

    pub fn dof_map(&self) -> Option<&DofMap> {
        self.dof_map.as_ref()
    }

    /// Numbers every DOF of the mesh
    pub fn assign_dofs(&mut self) -> Result<&DofMap> {
        if self.assembled {
            return Err(FemError::OrderingViolation(
                "cannot renumber an assembled system, call clear() first".to_owned(),
            ));
        }
        let map = DofMap::assign(self.mesh)?;
        info!(
            "numbered {} global freedoms over {} nodes",
            map.ngfn(),
            map.n_nodes()
        );
        Ok(self.dof_map.insert(map))
    }

    /// Assembles the global stiffness, landmark springs and multi-freedom
    /// constraints. Numbers the DOFs first if that has not happened.
    pub fn assemble_k(&mut self) -> Result<()> {
        if self.assembled {
            return Err(FemError::OrderingViolation(
                "stiffness already assembled, call clear() before assembling again".to_owned(),
            ));
        }
        if self.dof_map.is_none() {
            self.assign_dofs()?;
        }

        let mesh: &Mesh<D> = self.mesh;
        let dof_map = numbering(&self.dof_map)?;
        let ngfn = dof_map.ngfn();
        let strategy = self.config.mfc_strategy;

        let folded = select_constraints(mesh, dof_map, self.config.solution_sets)?;
        let landmarks = locate_landmarks(mesh, dof_map)?;
        let order = match strategy {
            MfcStrategy::LagrangeMultiplier => ngfn + folded.len(),
            MfcStrategy::Penalty { .. } => ngfn,
        };

        let ls = self.backend.get();
        ls.set_number_of_matrices(MATRIX_SLOTS);
        ls.set_number_of_vectors(VECTOR_SLOTS);
        ls.set_number_of_solutions(self.config.solution_sets);
        ls.set_system_order(order);
        ls.initialize_matrix(WORKING_MATRIX);

        info!(
            "assembling {} elements on the {} backend...",
            mesh.elements.len(),
            ls.name()
        );
        assemble_element_matrices(mesh, dof_map, ls, WORKING_MATRIX, self.config.show_progress)?;
        ls.copy_matrix(WORKING_MATRIX, ELEMENT_MATRIX);
        assemble_landmark_stiffness(&landmarks, ls, WORKING_MATRIX);

        let penalty_weight = match strategy {
            MfcStrategy::LagrangeMultiplier => 0.0,
            MfcStrategy::Penalty { scale } => {
                let largest = (0..ngfn)
                    .map(|i| ls.matrix_value(i, i, WORKING_MATRIX).abs())
                    .fold(0.0, f64::max);
                scale * if largest > 0.0 { largest } else { 1.0 }
            }
        };
        fold_constraints(
            mesh,
            dof_map,
            &folded,
            strategy,
            penalty_weight,
            ls,
            WORKING_MATRIX,
        )?;
        ls.copy_matrix(WORKING_MATRIX, UNCONSTRAINED_MATRIX);

        info!(
            "assembled system of order {} ({} constraints, {} landmarks)",
            order,
            folded.len(),
            landmarks.len()
        );

        self.folded = folded;
        self.landmarks = landmarks;
        self.penalty_weight = penalty_weight;
        self.assembled = true;
        self.applied_pattern = None;
        self.constrained = None;
        self.factorized = false;
        self.forced_set = None;
        Ok(())
    }

    /// Eliminates the essential boundary conditions active in solution set
    /// `dim` from the working matrix.
    ///
    /// The load the eliminated columns carried over to the free rows is kept
    /// for [`Solver::assemble_f`]. When the set fixes the same DOFs as the
    /// one before, the working matrix and its factorization are reused.
    pub fn apply_bc(&mut self, dim: usize) -> Result<()> {
        self.check_set(dim)?;
        if !self.assembled {
            return Err(FemError::OrderingViolation(
                "apply_bc called before assemble_k".to_owned(),
            ));
        }

        let mesh: &Mesh<D> = self.mesh;
        let dof_map = numbering(&self.dof_map)?;
        let ngfn = dof_map.ngfn();

        let fixed = active_fixed_dofs(mesh, dof_map, dim)?;
        let implied = implied_by_fixed(mesh, dof_map, &self.folded, &fixed, dim)?;
        let neutralized: Vec<usize> = match self.config.mfc_strategy {
            MfcStrategy::LagrangeMultiplier => implied.iter().map(|c| ngfn + c).collect(),
            MfcStrategy::Penalty { .. } => Vec::new(),
        };
        let mut pattern: Vec<usize> = fixed.keys().copied().collect();
        pattern.extend(neutralized.iter().copied());

        let ls = self.backend.get();
        ls.initialize_vector(CORRECTION_VECTOR);
        for (&gfn, &value) in fixed.iter() {
            if value == 0.0 {
                continue;
            }
            // the unconstrained system is symmetric, so row gfn lists column gfn's entries
            for row in ls.nonzero_columns_in_row(gfn, UNCONSTRAINED_MATRIX) {
                let coupling = ls.matrix_value(row, gfn, UNCONSTRAINED_MATRIX);
                ls.add_vector_value(row, -coupling * value, CORRECTION_VECTOR);
            }
        }

        if self.applied_pattern.as_ref() != Some(&pattern) {
            if self.applied_pattern.is_some() {
                ls.copy_matrix(UNCONSTRAINED_MATRIX, WORKING_MATRIX);
            }
            eliminate_rows(ls, &pattern, WORKING_MATRIX);
            debug!(
                "eliminated {} rows for solution set {}",
                pattern.len(),
                dim
            );
            self.applied_pattern = Some(pattern);
            self.factorized = false;
        } else {
            debug!("solution set {} reuses the constrained matrix", dim);
        }

        self.constrained = Some(ConstrainedSet {
            set: dim,
            fixed,
            neutralized,
        });
        self.forced_set = None;
        Ok(())
    }

    /// Assembles the force vector of solution set `dim`
    pub fn assemble_f(&mut self, dim: usize) -> Result<()> {
        self.check_set(dim)?;
        let constrained = match &self.constrained {
            Some(c) if c.set == dim => c,
            _ => {
                return Err(FemError::OrderingViolation(format!(
                    "assemble_f({}) called before apply_bc({})",
                    dim, dim
                )))
            }
        };

        let mesh: &Mesh<D> = self.mesh;
        let dof_map = numbering(&self.dof_map)?;
        let ls = self.backend.get();

        assemble_loads(
            mesh,
            dof_map,
            &self.landmarks,
            &self.folded,
            self.config.mfc_strategy,
            self.penalty_weight,
            dim,
            ls,
            FORCE_VECTOR,
        )?;

        for row in 0..ls.system_order() {
            let correction = ls.vector_value(row, CORRECTION_VECTOR);
            if correction != 0.0 {
                ls.add_vector_value(row, correction, FORCE_VECTOR);
            }
        }
        for (&gfn, &value) in constrained.fixed.iter() {
            ls.set_vector_value(gfn, value, FORCE_VECTOR);
        }
        for &row in constrained.neutralized.iter() {
            ls.set_vector_value(row, 0.0, FORCE_VECTOR);
        }

        self.forced_set = Some(dim);
        Ok(())
    }

    /// Factorizes the constrained matrix unless the current factorization
    /// still matches it
    pub fn decompose_k(&mut self) -> Result<()> {
        if self.applied_pattern.is_none() {
            return Err(FemError::OrderingViolation(
                "decompose_k called before apply_bc".to_owned(),
            ));
        }
        if self.factorized {
            debug!("reusing factorization");
            return Ok(());
        }

        let ls = self.backend.get();
        let start = Instant::now();
        ls.decompose(WORKING_MATRIX)?;
        let elapsed = (Instant::now() - start).as_secs_f32();
        info!(
            "factorized system of order {} in {:.3} seconds",
            ls.system_order(),
            elapsed
        );

        self.factorized = true;
        Ok(())
    }

    /// Solves solution set `dim` into solution slot `dim`
    pub fn run_solver(&mut self, dim: usize) -> Result<()> {
        self.check_set(dim)?;
        if !self.factorized {
            return Err(FemError::OrderingViolation(
                "run_solver called before decompose_k".to_owned(),
            ));
        }
        if self.forced_set != Some(dim) {
            return Err(FemError::OrderingViolation(format!(
                "run_solver({}) called before assemble_f({})",
                dim, dim
            )));
        }

        let start = Instant::now();
        self.backend.get().solve(WORKING_MATRIX, FORCE_VECTOR, dim)?;
        let elapsed = (Instant::now() - start).as_secs_f32();
        info!("solved set {} in {:.3} seconds", dim, elapsed);

        self.solved[dim] = true;
        Ok(())
    }

    /// Copies the solved values into the nodes. Sets that were not solved
    /// contribute zeros.
    pub fn update_displacements(&mut self) -> Result<()> {
        if !self.solved.iter().any(|s| *s) {
            return Err(FemError::OrderingViolation(
                "update_displacements called before any solution set was solved".to_owned(),
            ));
        }

        let dof_map = numbering(&self.dof_map)?;
        let ls = self.backend.get_ref();
        let sets = self.config.solution_sets;

        for (n, node) in self.mesh.nodes.iter_mut().enumerate() {
            let dofs = node.dofs;
            let mut values = vec![0.0; sets * dofs];
            for set in (0..sets).filter(|s| self.solved[*s]) {
                for dof in 0..dofs {
                    values[set * dofs + dof] = ls.solution_value(dof_map.gfn(n, dof)?, set);
                }
            }
            node.solution = values;
        }
        debug!("updated displacements of {} nodes", self.mesh.nodes.len());

        Ok(())
    }

    /// Runs every stage for every solution set and refreshes the
    /// interpolation grid if one was initialized
    pub fn solve(&mut self) -> Result<()> {
        info!(
            "solving {} solution set(s) for {} elements...",
            self.config.solution_sets,
            self.mesh.elements.len()
        );
        let start = Instant::now();

        self.clear();
        self.assemble_k()?;
        for set in 0..self.config.solution_sets {
            self.apply_bc(set)?;
            self.assemble_f(set)?;
            self.decompose_k()?;
            self.run_solver(set)?;
        }
        self.update_displacements()?;
        if self.grid.is_some() {
            self.fill_interpolation_grid()?;
        }

        let elapsed = (Instant::now() - start).as_secs_f32();
        info!("solve complete in {:.3} seconds", elapsed);
        Ok(())
    }

    fn check_solved(&self, set: usize) -> Result<()> {
        self.check_set(set)?;
        if !self.solved[set] {
            return Err(FemError::OutOfRange(format!(
                "solution set {} has not been solved",
                set
            )));
        }
        Ok(())
    }

    /// Solved value of global freedom `gfn` in solution set `set`
    pub fn solution(&self, gfn: usize, set: usize) -> Result<f64> {
        self.check_solved(set)?;
        if gfn >= self.ngfn() {
            return Err(FemError::OutOfRange(format!(
                "freedom {} requested but the system has {}",
                gfn,
                self.ngfn()
            )));
        }
        Ok(self.backend.get_ref().solution_value(gfn, set))
    }

    /// Strain energy `½ uᵀ K u` of a solution set over the element
    /// stiffness alone
    pub fn deformation_energy(&self, set: usize) -> Result<f64> {
        self.check_solved(set)?;
        let ls = self.backend.get_ref();
        let ngfn = self.ngfn();

        let mut energy = 0.0;
        for i in 0..ngfn {
            let ui = ls.solution_value(i, set);
            if ui == 0.0 {
                continue;
            }
            for j in ls.nonzero_columns_in_row(i, ELEMENT_MATRIX) {
                if j < ngfn {
                    energy += ui * ls.matrix_value(i, j, ELEMENT_MATRIX) * ls.solution_value(j, set);
                }
            }
        }

        Ok(0.5 * energy)
    }

    /// Places an interpolation grid and fills it from the current mesh
    pub fn initialize_interpolation_grid(&mut self, geometry: GridGeometry<D>) -> Result<()> {
        self.grid = Some(InterpolationGrid::new(geometry));
        self.fill_interpolation_grid()
    }

    /// Unit-spaced grid over `0 ..= size - 1` on every axis
    pub fn initialize_interpolation_grid_from_size(&mut self, size: [usize; D]) -> Result<()> {
        self.initialize_interpolation_grid(GridGeometry::from_size(size)?)
    }

    /// Rebuilds the grid from the mesh's current deformed configuration.
    /// Needed after every displacement update.
    pub fn fill_interpolation_grid(&mut self) -> Result<()> {
        match &mut self.grid {
            Some(grid) => grid.fill(self.mesh, self.config.show_progress),
            None => Err(FemError::UninitializedGrid(
                "fill_interpolation_grid called before initialize_interpolation_grid".to_owned(),
            )),
        }
    }

    pub fn interpolation_grid(&self) -> Option<&InterpolationGrid<D>> {
        self.grid.as_ref()
    }

    /// Element containing a physical point of the deformed mesh, if any
    pub fn element_at_point(&self, point: &Point<D>) -> Result<Option<usize>> {
        match &self.grid {
            Some(grid) => grid.element_at(self.mesh, point),
            None => Err(FemError::UninitializedGrid(
                "element_at_point called before initialize_interpolation_grid".to_owned(),
            )),
        }
    }

    /// Displacement at a physical point of the deformed mesh, interpolated
    /// from the nodes of the element containing it
    pub fn interpolate_displacement(&self, point: &Point<D>) -> Result<Option<Point<D>>> {
        let index = match self.element_at_point(point)? {
            Some(index) => index,
            None => return Ok(None),
        };

        let element = self.mesh.element(index)?;
        let coords = self.mesh.element_coordinates(index, Configuration::Deformed)?;
        let local = match element.local_coordinates(&coords, point) {
            Some(local) => local,
            None => return Ok(None),
        };
        let displacements: Vec<Point<D>> = element
            .node_ids()
            .iter()
            .map(|&n| self.mesh.nodes[n].displacement())
            .collect();

        Ok(Some(element.interpolate(&local, &displacements)))
    }
}
