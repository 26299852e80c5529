//! Scatter of element, landmark and constraint contributions into the
//! global matrix and force vector.

use indicatif::ProgressBar;
use log::{info, warn};
use nalgebra::DVector;

use crate::{
    constraints::{coefficient_row, ConstraintBasis, Verdict},
    datatypes::{spatial_component, Configuration, Load, Point},
    dof::DofMap,
    error::{FemError, Result},
    linear_system::LinearSystem,
    mesh::Mesh,
};

/// How multi-freedom constraints enter the global system
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MfcStrategy {
    /// One extra row and column per constraint holding its coefficients.
    /// Exact, keeps symmetry, makes the system indefinite.
    LagrangeMultiplier,
    /// `w·cᵢ·cⱼ` added to the stiffness with `w = scale · max|Kᵢᵢ|`.
    /// Approximate, keeps the system positive definite.
    Penalty { scale: f64 },
}

impl Default for MfcStrategy {
    fn default() -> Self {
        MfcStrategy::LagrangeMultiplier
    }
}

/// A landmark load resolved to the element holding its source point
#[derive(Debug, Clone)]
pub struct LandmarkSite<const D: usize> {
    pub element: usize,
    pub gfns: Vec<usize>,
    pub dofs_per_node: usize,
    pub shape: DVector<f64>,
    pub discrepancy: Point<D>,
    pub weight: f64,
}

pub(crate) fn progress_bar(len: u64, show: bool) -> ProgressBar {
    if show {
        ProgressBar::new(len)
    } else {
        ProgressBar::hidden()
    }
}

/// Adds every element's local stiffness into matrix slot `matrix`
pub fn assemble_element_matrices<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    ls: &mut dyn LinearSystem,
    matrix: usize,
    show_progress: bool,
) -> Result<()> {
    let bar = progress_bar(mesh.elements.len() as u64, show_progress);

    for (index, element) in mesh.elements.iter().enumerate() {
        let coords = mesh.element_coordinates(index, Configuration::Reference)?;
        let gfns = dof_map.element_gfns(element.node_ids())?;

        let measure = element.shape_function_integrals(&coords).sum();
        if !(measure.is_finite() && measure > 0.0) {
            return Err(FemError::InvalidMesh(format!(
                "element {} has degenerate geometry (measure {:e})",
                index, measure
            )));
        }
        let ke = element.stiffness_matrix(&coords);
        if ke.iter().any(|v| !v.is_finite()) {
            return Err(FemError::InvalidMesh(format!(
                "element {} produced a non-finite stiffness matrix",
                index
            )));
        }

        if ke.nrows() != gfns.len() || ke.ncols() != gfns.len() {
            return Err(FemError::InvalidMesh(format!(
                "element {} produced a {}x{} stiffness matrix for {} dofs",
                index,
                ke.nrows(),
                ke.ncols(),
                gfns.len()
            )));
        }

        for (local_row, global_row) in gfns.iter().enumerate() {
            for (local_col, global_col) in gfns.iter().enumerate() {
                let value = ke[(local_row, local_col)];
                if value != 0.0 {
                    ls.add_matrix_value(*global_row, *global_col, value, matrix);
                }
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();
    info!(
        "assembled {} element stiffness matrices into a {} dof system",
        mesh.elements.len(),
        dof_map.ngfn()
    );

    Ok(())
}

/// Resolves every landmark load to the element containing its source
/// point in the reference configuration. Landmarks outside the mesh are
/// skipped.
pub fn locate_landmarks<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
) -> Result<Vec<LandmarkSite<D>>> {
    let mut sites = Vec::new();

    for load in mesh.loads.iter() {
        let (source, target, weight) = match load {
            Load::Landmark {
                source,
                target,
                weight,
            } => (source, target, *weight),
            _ => continue,
        };

        match mesh.locate(source, Configuration::Reference)? {
            Some((element, local)) => {
                let e = mesh.element(element)?;
                sites.push(LandmarkSite {
                    element,
                    gfns: dof_map.element_gfns(e.node_ids())?,
                    dofs_per_node: e.dofs_per_node(),
                    shape: e.shape_functions(&local),
                    discrepancy: target - source,
                    weight,
                });
            }
            None => warn!(
                "landmark at {:?} lies outside every element, skipping",
                source.as_slice()
            ),
        }
    }

    Ok(sites)
}

/// Adds the penalty springs of the landmarks: `w·Nₙ·Nₘ` on every DOF slot
pub fn assemble_landmark_stiffness<const D: usize>(
    sites: &[LandmarkSite<D>],
    ls: &mut dyn LinearSystem,
    matrix: usize,
) {
    for site in sites {
        let dofs = site.dofs_per_node;
        for (n, shape_n) in site.shape.iter().enumerate() {
            for (m, shape_m) in site.shape.iter().enumerate() {
                let value = site.weight * shape_n * shape_m;
                for k in 0..dofs {
                    ls.add_matrix_value(site.gfns[n * dofs + k], site.gfns[m * dofs + k], value, matrix);
                }
            }
        }
    }
}

/// Checks the mesh's multi-freedom constraints against each other.
///
/// Returns the indices of the constraints to fold into the system. Redundant
/// constraints are left out with a warning; an unsatisfiable one fails.
pub fn select_constraints<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    solution_sets: usize,
) -> Result<Vec<usize>> {
    let mut basis = ConstraintBasis::new();
    let mut selected = Vec::new();

    for (index, mfc) in mesh.constraints.iter().enumerate() {
        let row = coefficient_row(mesh, dof_map, index)?;
        let rhs = DVector::from_fn(solution_sets, |s, _| mfc.rhs_for(s));

        match basis.insert(row, rhs) {
            Ok(Verdict::Independent) => selected.push(index),
            Ok(Verdict::Redundant) => {
                warn!("constraint {} is implied by earlier constraints, skipping", index)
            }
            Err(set) => {
                return Err(FemError::ConstraintConflict(format!(
                    "constraint {} contradicts earlier constraints in solution set {}",
                    index, set
                )))
            }
        }
    }

    Ok(selected)
}

/// Folds the selected constraints into matrix slot `matrix`.
///
/// Lagrange multiplier `c` lives at row and column `NGFN + c`.
pub fn fold_constraints<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    selected: &[usize],
    strategy: MfcStrategy,
    penalty_weight: f64,
    ls: &mut dyn LinearSystem,
    matrix: usize,
) -> Result<()> {
    let ngfn = dof_map.ngfn();

    for (c, &index) in selected.iter().enumerate() {
        let row = coefficient_row(mesh, dof_map, index)?;
        let support: Vec<(usize, f64)> = row
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (i, *v))
            .collect();

        match strategy {
            MfcStrategy::LagrangeMultiplier => {
                for &(gfn, coefficient) in support.iter() {
                    ls.add_matrix_value(ngfn + c, gfn, coefficient, matrix);
                    ls.add_matrix_value(gfn, ngfn + c, coefficient, matrix);
                }
            }
            MfcStrategy::Penalty { .. } => {
                for &(i, ci) in support.iter() {
                    for &(j, cj) in support.iter() {
                        ls.add_matrix_value(i, j, penalty_weight * ci * cj, matrix);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Builds force vector slot `vector` for one solution set from the mesh's
/// loads, the landmark sites and the constraint right-hand sides.
#[allow(clippy::too_many_arguments)]
pub fn assemble_loads<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    sites: &[LandmarkSite<D>],
    selected: &[usize],
    strategy: MfcStrategy,
    penalty_weight: f64,
    set: usize,
    ls: &mut dyn LinearSystem,
    vector: usize,
) -> Result<()> {
    ls.initialize_vector(vector);

    for load in mesh.loads.iter().filter(|l| l.applies_to(set)) {
        match load {
            Load::Nodal { node, force, .. } => {
                for (dof, value) in force.iter().enumerate() {
                    ls.add_vector_value(dof_map.gfn(*node, dof)?, *value, vector);
                }
            }
            Load::Element {
                element, intensity, ..
            } => {
                let e = mesh.element(*element)?;
                let coords = mesh.element_coordinates(*element, Configuration::Reference)?;
                let integrals = e.shape_function_integrals(&coords);
                let gfns = dof_map.element_gfns(e.node_ids())?;
                let dofs = e.dofs_per_node();
                for (n, integral) in integrals.iter().enumerate() {
                    for (k, value) in intensity.iter().enumerate().take(dofs) {
                        ls.add_vector_value(gfns[n * dofs + k], integral * value, vector);
                    }
                }
            }
            // resolved into sites when the stiffness was assembled
            Load::Landmark { .. } => {}
        }
    }

    for site in sites {
        let dofs = site.dofs_per_node;
        for k in 0..dofs {
            let component = match spatial_component::<D>(set, k, dofs) {
                Some(c) => c,
                None => continue,
            };
            let pull = site.weight * site.discrepancy[component];
            for (n, shape) in site.shape.iter().enumerate() {
                ls.add_vector_value(site.gfns[n * dofs + k], pull * shape, vector);
            }
        }
    }

    let ngfn = dof_map.ngfn();
    for (c, &index) in selected.iter().enumerate() {
        let rhs = mesh.constraints[index].rhs_for(set);
        match strategy {
            MfcStrategy::LagrangeMultiplier => ls.set_vector_value(ngfn + c, rhs, vector),
            MfcStrategy::Penalty { .. } => {
                let row = coefficient_row(mesh, dof_map, index)?;
                for (gfn, coefficient) in row.iter().enumerate() {
                    if *coefficient != 0.0 {
                        ls.add_vector_value(gfn, penalty_weight * coefficient * rhs, vector);
                    }
                }
            }
        }
    }

    Ok(())
}
