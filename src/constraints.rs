//! Consistency checks for essential boundary conditions and multi-freedom
//! constraints.
//!
//! Constraints are fed one at a time into a [`ConstraintBasis`], which keeps
//! an orthonormal basis of the accepted coefficient rows (modified
//! Gram-Schmidt) and carries each row's right-hand sides along through the
//! same row operations. A new row that is dependent on the accepted ones is
//! either redundant (its reduced right-hand side vanishes in every solution
//! set) or conflicting.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::{
    dof::DofMap,
    error::{FemError, Result},
    mesh::Mesh,
};

/// Relative size below which a reduced coefficient row counts as dependent
pub const DEPENDENCE_TOL: f64 = 1e-10;
/// Relative size above which a reduced right-hand side counts as a conflict
pub const CONSISTENCY_TOL: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Independent,
    Redundant,
}

/// Orthonormal basis of accepted constraint rows
#[derive(Debug, Default)]
pub struct ConstraintBasis {
    rows: Vec<(DVector<f64>, DVector<f64>)>,
}

impl ConstraintBasis {
    pub fn new() -> ConstraintBasis {
        ConstraintBasis { rows: Vec::new() }
    }

    /// Number of independent rows accepted so far
    pub fn rank(&self) -> usize {
        self.rows.len()
    }

    /// Offers a constraint `coefficients · u = rhs[s]` (one rhs per set).
    ///
    /// Returns the verdict, or `Err(set)` naming the first solution set in
    /// which the constraint cannot hold together with the accepted ones.
    pub fn insert(
        &mut self,
        coefficients: DVector<f64>,
        rhs: DVector<f64>,
    ) -> std::result::Result<Verdict, usize> {
        let scale = coefficients.norm();
        let mut c = coefficients;
        let mut r = rhs.clone();
        let mut magnitude = rhs.abs();

        for (q, beta) in self.rows.iter() {
            let p = c.dot(q);
            c.axpy(-p, q, 1.0);
            r.axpy(-p, beta, 1.0);
            magnitude += beta.abs() * p.abs();
        }

        let residual = c.norm();
        if scale == 0.0 || residual <= DEPENDENCE_TOL * scale {
            for s in 0..r.nrows() {
                if r[s].abs() > CONSISTENCY_TOL * magnitude[s] {
                    return Err(s);
                }
            }
            return Ok(Verdict::Redundant);
        }

        self.rows.push((c / residual, r / residual));
        Ok(Verdict::Independent)
    }
}

/// Essential boundary conditions active in one solution set, as
/// `gfn -> prescribed value`.
///
/// Duplicates with equal values are merged; two different values for the
/// same DOF are a conflict.
pub fn active_fixed_dofs<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    set: usize,
) -> Result<BTreeMap<usize, f64>> {
    let mut fixed: BTreeMap<usize, f64> = BTreeMap::new();

    for bc in mesh.boundary_conditions.iter().filter(|bc| bc.is_active(set)) {
        let gfn = dof_map.gfn(bc.node, bc.dof)?;
        match fixed.get(&gfn) {
            Some(existing) => {
                let tol = CONSISTENCY_TOL * existing.abs().max(bc.value.abs()).max(1.0);
                if (existing - bc.value).abs() > tol {
                    return Err(FemError::ConstraintConflict(format!(
                        "dof {} of node {} is fixed to both {} and {} in solution set {}",
                        bc.dof, bc.node, existing, bc.value, set
                    )));
                }
            }
            None => {
                fixed.insert(gfn, bc.value);
            }
        }
    }

    Ok(fixed)
}

/// Dense coefficient row of a constraint over the GFNs
pub fn coefficient_row<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    index: usize,
) -> Result<DVector<f64>> {
    let mut row = DVector::zeros(dof_map.ngfn());
    for term in mesh.constraints[index].terms.iter() {
        row[dof_map.gfn(term.node, term.dof)?] += term.coefficient;
    }
    Ok(row)
}

/// Checks the constraints folded into the system against the DOFs fixed in
/// one solution set.
///
/// Returns the positions, within `folded`, of the constraints the fixed DOFs
/// (together with earlier constraints) already imply. Fails when a constraint
/// cannot hold with the prescribed values.
pub fn implied_by_fixed<const D: usize>(
    mesh: &Mesh<D>,
    dof_map: &DofMap,
    folded: &[usize],
    fixed: &BTreeMap<usize, f64>,
    set: usize,
) -> Result<Vec<usize>> {
    let rows = folded
        .iter()
        .map(|&index| coefficient_row(mesh, dof_map, index))
        .collect::<Result<Vec<DVector<f64>>>>()?;

    let mut basis = ConstraintBasis::new();
    for (&gfn, &value) in fixed.iter() {
        if rows.iter().all(|row| row[gfn] == 0.0) {
            continue;
        }
        let mut unit = DVector::zeros(dof_map.ngfn());
        unit[gfn] = 1.0;
        basis
            .insert(unit, DVector::from_element(1, value))
            .map_err(|_| FemError::ConstraintConflict(format!("dof {} is fixed twice", gfn)))?;
    }

    let mut implied = Vec::new();
    for (c, (row, &index)) in rows.into_iter().zip(folded.iter()).enumerate() {
        let rhs = DVector::from_element(1, mesh.constraints[index].rhs_for(set));
        match basis.insert(row, rhs) {
            Ok(Verdict::Independent) => {}
            Ok(Verdict::Redundant) => implied.push(c),
            Err(_) => {
                return Err(FemError::ConstraintConflict(format!(
                    "constraint {} cannot hold together with the boundary conditions of solution set {}",
                    index, set
                )))
            }
        }
    }

    Ok(implied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::{BoundaryCondition, MfcTerm, MultiFreedomConstraint};
    use crate::element::{Bar1D, LinearElasticity};
    use nalgebra::Vector1;

    fn row(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    #[test]
    fn independent_rows_are_accepted() {
        let mut basis = ConstraintBasis::new();
        assert_eq!(
            basis.insert(row(&[1.0, 1.0, 0.0]), row(&[2.0])),
            Ok(Verdict::Independent)
        );
        assert_eq!(
            basis.insert(row(&[0.0, 1.0, -1.0]), row(&[0.0])),
            Ok(Verdict::Independent)
        );
        assert_eq!(basis.rank(), 2);
    }

    #[test]
    fn contradictory_rows_conflict() {
        let mut basis = ConstraintBasis::new();
        basis.insert(row(&[1.0, 0.0]), row(&[1.0])).unwrap();
        assert_eq!(basis.insert(row(&[1.0, 0.0]), row(&[2.0])), Err(0));
    }

    #[test]
    fn consistent_combination_is_redundant() {
        let mut basis = ConstraintBasis::new();
        basis.insert(row(&[1.0, 0.0, 0.0]), row(&[1.0, 3.0])).unwrap();
        basis.insert(row(&[0.0, 1.0, 0.0]), row(&[2.0, 4.0])).unwrap();
        // u0 + 2 u1 = 5 in set 0 and 11 in set 1
        assert_eq!(
            basis.insert(row(&[1.0, 2.0, 0.0]), row(&[5.0, 11.0])),
            Ok(Verdict::Redundant)
        );
        // consistent in set 0 only
        assert_eq!(
            basis.insert(row(&[1.0, 2.0, 0.0]), row(&[5.0, 12.0])),
            Err(1)
        );
        assert_eq!(basis.rank(), 2);
    }

    #[test]
    fn empty_row_needs_zero_rhs() {
        let mut basis = ConstraintBasis::new();
        assert_eq!(
            basis.insert(row(&[0.0, 0.0]), row(&[0.0])),
            Ok(Verdict::Redundant)
        );
        assert_eq!(basis.insert(row(&[0.0, 0.0]), row(&[1.0])), Err(0));
    }

    #[test]
    fn fixed_dofs_merge_duplicates_and_reject_conflicts() {
        let mut mesh: Mesh<1> = Mesh::new();
        mesh.add_node(Vector1::new(0.0), 1);
        mesh.add_node(Vector1::new(1.0), 1);
        mesh.add_element(Bar1D::new([0, 1], LinearElasticity::default()));
        mesh.add_boundary_condition(BoundaryCondition::fixed(0, 0, 0.0));
        mesh.add_boundary_condition(BoundaryCondition::fixed(0, 0, 0.0));
        mesh.add_boundary_condition(BoundaryCondition {
            node: 1,
            dof: 0,
            value: 2.0,
            dim: Some(1),
        });
        let map = DofMap::assign(&mesh).unwrap();

        assert_eq!(active_fixed_dofs(&mesh, &map, 0).unwrap().len(), 1);
        assert_eq!(active_fixed_dofs(&mesh, &map, 1).unwrap().len(), 2);

        mesh.add_boundary_condition(BoundaryCondition::fixed(0, 0, 1.0));
        assert!(matches!(
            active_fixed_dofs(&mesh, &map, 0),
            Err(FemError::ConstraintConflict(_))
        ));
    }

    #[test]
    fn fixed_dofs_can_imply_or_contradict_constraints() {
        let mut mesh: Mesh<1> = Mesh::new();
        for x in [0.0, 1.0, 2.0] {
            mesh.add_node(Vector1::new(x), 1);
        }
        mesh.add_element(Bar1D::new([0, 1], LinearElasticity::default()));
        mesh.add_element(Bar1D::new([1, 2], LinearElasticity::default()));
        // u0 - u2 = 0
        mesh.add_constraint(MultiFreedomConstraint::new(
            vec![
                MfcTerm {
                    node: 0,
                    dof: 0,
                    coefficient: 1.0,
                },
                MfcTerm {
                    node: 2,
                    dof: 0,
                    coefficient: -1.0,
                },
            ],
            0.0,
        ));
        let map = DofMap::assign(&mesh).unwrap();
        let g0 = map.gfn(0, 0).unwrap();
        let g2 = map.gfn(2, 0).unwrap();

        let one_end = BTreeMap::from([(g0, 0.1)]);
        assert!(implied_by_fixed(&mesh, &map, &[0], &one_end, 0)
            .unwrap()
            .is_empty());

        let both_ends = BTreeMap::from([(g0, 0.1), (g2, 0.1)]);
        assert_eq!(implied_by_fixed(&mesh, &map, &[0], &both_ends, 0).unwrap(), vec![0]);

        let apart = BTreeMap::from([(g0, 0.1), (g2, 0.2)]);
        assert!(matches!(
            implied_by_fixed(&mesh, &map, &[0], &apart, 0),
            Err(FemError::ConstraintConflict(_))
        ));
    }
}
