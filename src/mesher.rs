use json::JsonValue;
use log::info;
use nalgebra::{Vector1, Vector2};

use crate::{
    assembly::MfcStrategy,
    datatypes::{BoundaryCondition, Load, MfcTerm, MultiFreedomConstraint, Point},
    element::{Bar1D, LinearElasticity, Triangle3, TrianglePhysics},
    error::{FemError, Result},
    grid::GridGeometry,
    mesh::Mesh,
    solver::SolverConfig,
};

/// Penalty scale used when the input selects penalty constraints without one
pub const DEFAULT_PENALTY_SCALE: f64 = 1e8;

const AXES: [&str; 3] = ["x", "y", "z"];

/// Mesh families the problem file can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshKind {
    Bar,
    Rectangle,
}

/// Everything needed to run one analysis
pub struct Problem<const D: usize> {
    pub mesh: Mesh<D>,
    pub config: SolverConfig,
    pub grid: Option<GridGeometry<D>>,
    /// Points whose element and displacement should be reported
    pub queries: Vec<Point<D>>,
}

/// Generates a straight bar of equal length elements along x
///
/// # Arguments
/// * `length` - Total length of the bar
/// * `cells` - Number of bar elements
/// * `material` - Material shared by every element
///
/// # Returns
/// A 1D mesh whose node `i` sits at `i * length / cells`
pub fn bar_mesh(length: f64, cells: usize, material: LinearElasticity) -> Result<Mesh<1>> {
    if cells == 0 || !(length > 0.0) {
        return Err(FemError::Input(format!(
            "Bar mesh needs a positive length and at least one cell (got length {}, {} cells)",
            length, cells
        )));
    }

    let mut mesh = Mesh::new();
    let step = length / cells as f64;
    for i in 0..=cells {
        mesh.add_node(Vector1::new(i as f64 * step), 1);
    }
    for i in 0..cells {
        mesh.add_element(Bar1D::new([i, i + 1], material));
    }

    info!(
        "generated bar mesh with {} nodes and {} elements",
        mesh.nodes.len(),
        mesh.elements.len()
    );
    Ok(mesh)
}

/// Generates a structured triangle mesh of a rectangle with its lower left
/// corner at the origin
///
/// # Arguments
/// * `width` - Extent along x
/// * `height` - Extent along y
/// * `cells_x` - Number of cells along x
/// * `cells_y` - Number of cells along y
/// * `material` - Material shared by every element
/// * `physics` - Membrane (two DOFs per node) or Laplace (one DOF per node)
///
/// # Returns
/// A 2D mesh with `(cells_x + 1) * (cells_y + 1)` nodes numbered row by row
/// and two counter-clockwise triangles per cell
pub fn rectangle_mesh(
    width: f64,
    height: f64,
    cells_x: usize,
    cells_y: usize,
    material: LinearElasticity,
    physics: TrianglePhysics,
) -> Result<Mesh<2>> {
    if cells_x == 0 || cells_y == 0 || !(width > 0.0) || !(height > 0.0) {
        return Err(FemError::Input(format!(
            "Rectangle mesh needs positive dimensions and cell counts (got {}x{} with {}x{} cells)",
            width, height, cells_x, cells_y
        )));
    }

    let dofs = match physics {
        TrianglePhysics::Membrane => 2,
        TrianglePhysics::Laplace => 1,
    };
    let dx = width / cells_x as f64;
    let dy = height / cells_y as f64;

    let mut mesh = Mesh::new();
    for j in 0..=cells_y {
        for i in 0..=cells_x {
            mesh.add_node(Vector2::new(i as f64 * dx, j as f64 * dy), dofs);
        }
    }

    let row = cells_x + 1;
    for j in 0..cells_y {
        for i in 0..cells_x {
            let n00 = j * row + i;
            let n10 = n00 + 1;
            let n01 = n00 + row;
            let n11 = n01 + 1;
            mesh.add_element(Triangle3 {
                nodes: [n00, n10, n11],
                material,
                physics,
            });
            mesh.add_element(Triangle3 {
                nodes: [n00, n11, n01],
                material,
                physics,
            });
        }
    }

    info!(
        "generated rectangle mesh with {} nodes and {} elements",
        mesh.nodes.len(),
        mesh.elements.len()
    );
    Ok(mesh)
}

/// Parses problem json text, checking the mandatory sections
pub fn parse_input(contents: &str) -> Result<JsonValue> {
    let input_json = match json::parse(contents) {
        Ok(f) => f,
        Err(err) => return Err(FemError::Input(format!("Error in input file json: {err}"))),
    };

    for section in ["metadata", "mesh", "boundary_conditions"] {
        if !input_json.has_key(section) {
            return Err(FemError::Input(format!(
                "Input json missing {section} field"
            )));
        }
    }

    Ok(input_json)
}

/// Parses the input json into a JsonValue object
///
/// # Arguments
/// * `input_file` - The path to the input file
///
/// # Returns
/// A JsonValue object
pub fn load_input_file(input_file: &str) -> Result<JsonValue> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(err) => {
            return Err(FemError::Input(format!(
                "Unable to open input file {}: {err}",
                input_file
            )))
        }
    };

    parse_input(&file_string)
}

pub fn mesh_kind(input_json: &JsonValue) -> Result<MeshKind> {
    match input_json["mesh"]["kind"].as_str() {
        Some("bar") => Ok(MeshKind::Bar),
        Some("rectangle") => Ok(MeshKind::Rectangle),
        Some(other) => Err(FemError::Input(format!("Unknown mesh kind '{other}'"))),
        None => Err(FemError::Input(
            "Input json missing kind field in mesh section".to_owned(),
        )),
    }
}

fn field_f64(value: &JsonValue, key: &str, context: &str) -> Result<f64> {
    match value[key].as_f64() {
        Some(v) => Ok(v),
        None => Err(FemError::Input(format!(
            "Input json missing numeric {key} field in {context}"
        ))),
    }
}

fn field_usize(value: &JsonValue, key: &str, context: &str) -> Result<usize> {
    match value[key].as_usize() {
        Some(v) => Ok(v),
        None => Err(FemError::Input(format!(
            "Input json missing non-negative integer {key} field in {context}"
        ))),
    }
}

/// Optional number: absent is fine, present but not a number is an error
fn optional_f64(value: &JsonValue, key: &str, context: &str) -> Result<Option<f64>> {
    if value[key].is_null() {
        return Ok(None);
    }
    field_f64(value, key, context).map(Some)
}

fn parse_point<const D: usize>(value: &JsonValue, context: &str) -> Result<Point<D>> {
    if !value.is_array() || value.len() != D {
        return Err(FemError::Input(format!(
            "{context} must be an array of {D} numbers"
        )));
    }
    let mut point = Point::<D>::zeros();
    for (axis, member) in value.members().enumerate() {
        point[axis] = match member.as_f64() {
            Some(v) => v,
            None => {
                return Err(FemError::Input(format!(
                    "Non-numeric coordinate in {context}"
                )))
            }
        };
    }
    Ok(point)
}

/// Parses the material from the metadata section
///
/// # Arguments
/// * `input_json` - The input file as a JsonValue object
/// * `planar` - Whether a part thickness is required
fn parse_material(input_json: &JsonValue, planar: bool) -> Result<LinearElasticity> {
    let metadata = &input_json["metadata"];
    let youngs_modulus = field_f64(metadata, "youngs_modulus", "metadata section")?;
    let poisson_ratio = field_f64(metadata, "poisson_ratio", "metadata section")?;
    let thickness = if planar {
        field_f64(metadata, "part_thickness", "metadata section")?
    } else {
        1.0
    };
    let cross_section_area =
        optional_f64(&input_json["mesh"], "cross_section_area", "mesh section")?.unwrap_or(1.0);

    if !(youngs_modulus > 0.0) {
        return Err(FemError::Input(format!(
            "youngs_modulus must be positive, got {youngs_modulus}"
        )));
    }
    if !(-1.0..0.5).contains(&poisson_ratio) {
        return Err(FemError::Input(format!(
            "poisson_ratio must lie in [-1, 0.5), got {poisson_ratio}"
        )));
    }
    if !(thickness > 0.0) || !(cross_section_area > 0.0) {
        return Err(FemError::Input(
            "part_thickness and cross_section_area must be positive".to_owned(),
        ));
    }

    Ok(LinearElasticity {
        youngs_modulus,
        poisson_ratio,
        cross_section_area,
        thickness,
    })
}

fn parse_config(input_json: &JsonValue, solution_sets: usize) -> Result<SolverConfig> {
    let metadata = &input_json["metadata"];
    let mfc_strategy = match metadata["mfc_strategy"].as_str() {
        None | Some("lagrange") => MfcStrategy::LagrangeMultiplier,
        Some("penalty") => MfcStrategy::Penalty {
            scale: optional_f64(metadata, "penalty_scale", "metadata section")?
                .unwrap_or(DEFAULT_PENALTY_SCALE),
        },
        Some(other) => {
            return Err(FemError::Input(format!(
                "Unknown mfc_strategy '{other}', expected lagrange or penalty"
            )))
        }
    };

    Ok(SolverConfig {
        solution_sets,
        mfc_strategy,
        show_progress: false,
        time_step: optional_f64(metadata, "time_step", "metadata section")?.unwrap_or(0.0),
    })
}

/// A region rule from the boundary_conditions section
struct BoundaryRule<const D: usize> {
    name: String,
    min: Point<D>,
    max: Point<D>,
    displacement: [Option<f64>; D],
    force: [Option<f64>; D],
}

impl<const D: usize> BoundaryRule<D> {
    fn contains(&self, point: &Point<D>) -> bool {
        (0..D).all(|a| point[a] > self.min[a] && point[a] < self.max[a])
    }
}

/// DOF and solution set carrying spatial axis `axis` of a node
fn axis_slot<const D: usize>(dofs: usize, axis: usize) -> Option<(usize, Option<usize>)> {
    if dofs == D {
        Some((axis, None))
    } else if dofs == 1 {
        Some((0, Some(axis)))
    } else {
        None
    }
}

/// Applies boundary conditions to the nodes of the mesh from the input json
///
/// Every rule selects the nodes strictly inside its region and prescribes
/// displacements (`ux`, `uy`, ...) or applies forces (`fx`, `fy`, ...). For
/// scalar nodes the axis selects the solution set instead of the DOF.
///
/// # Arguments
/// * `input_json` - The input file as a JsonValue object
/// * `mesh` - The mesh receiving boundary conditions and nodal loads
///
/// # Returns
/// The number of rules loaded
pub fn apply_boundary_conditions<const D: usize>(
    input_json: &JsonValue,
    mesh: &mut Mesh<D>,
) -> Result<usize> {
    let mut rules: Vec<BoundaryRule<D>> = Vec::new();

    for (name, rule_json) in input_json["boundary_conditions"].entries() {
        if !rule_json.has_key("region") {
            return Err(FemError::Input(format!(
                "Boundary rule {name} is missing region field"
            )));
        }
        if !rule_json.has_key("targets") {
            return Err(FemError::Input(format!(
                "Boundary rule {name} is missing targets field"
            )));
        }

        let context = format!("boundary rule {name}");
        let mut rule = BoundaryRule {
            name: name.to_string(),
            min: Point::<D>::from_element(f64::MIN),
            max: Point::<D>::from_element(f64::MAX),
            displacement: [None; D],
            force: [None; D],
        };
        for (a, axis) in AXES.iter().take(D).enumerate() {
            let region = &rule_json["region"];
            if let Some(v) = optional_f64(region, &format!("{axis}_target_min"), &context)? {
                rule.min[a] = v;
            }
            if let Some(v) = optional_f64(region, &format!("{axis}_target_max"), &context)? {
                rule.max[a] = v;
            }
            let targets = &rule_json["targets"];
            rule.displacement[a] = optional_f64(targets, &format!("u{axis}"), &context)?;
            rule.force[a] = optional_f64(targets, &format!("f{axis}"), &context)?;

            if rule.min[a] > rule.max[a] {
                return Err(FemError::Input(format!(
                    "Boundary '{name}' has {axis}_target_min greater than {axis}_target_max"
                )));
            }
            if rule.displacement[a].is_some() && rule.force[a].is_some() {
                return Err(FemError::Input(format!(
                    "Boundary '{name}' is over-constrained in {axis}-axis"
                )));
            }
        }
        if rule.displacement.iter().chain(rule.force.iter()).all(|t| t.is_none()) {
            return Err(FemError::Input(format!("Boundary '{name}' has no targets")));
        }

        rules.push(rule);
    }
    info!("loaded {} boundary rules from input file", rules.len());

    let mut boundary_conditions = Vec::new();
    let mut loads = Vec::new();
    for (n, node) in mesh.nodes.iter().enumerate() {
        for rule in rules.iter().filter(|r| r.contains(&node.position)) {
            for axis in 0..D {
                let (dof, dim) = match axis_slot::<D>(node.dofs, axis) {
                    Some(slot) => slot,
                    None => {
                        return Err(FemError::Input(format!(
                            "Boundary '{}' selects node {} whose {} dofs match no axis layout",
                            rule.name, n, node.dofs
                        )))
                    }
                };
                if let Some(value) = rule.displacement[axis] {
                    boundary_conditions.push(BoundaryCondition {
                        node: n,
                        dof,
                        value,
                        dim,
                    });
                }
                if let Some(value) = rule.force[axis] {
                    let mut force = vec![0.0; node.dofs];
                    force[dof] = value;
                    loads.push(Load::Nodal {
                        node: n,
                        force,
                        dim,
                    });
                }
            }
        }
    }
    info!(
        "applied {} prescribed displacements and {} nodal loads",
        boundary_conditions.len(),
        loads.len()
    );

    mesh.boundary_conditions.extend(boundary_conditions);
    mesh.loads.extend(loads);
    Ok(rules.len())
}

fn parse_constraints<const D: usize>(input_json: &JsonValue, mesh: &mut Mesh<D>) -> Result<()> {
    for (i, constraint_json) in input_json["constraints"].members().enumerate() {
        let context = format!("constraint {i}");
        let mut terms = Vec::new();
        for term_json in constraint_json["terms"].members() {
            terms.push(MfcTerm {
                node: field_usize(term_json, "node", &context)?,
                dof: field_usize(term_json, "dof", &context)?,
                coefficient: field_f64(term_json, "coefficient", &context)?,
            });
        }
        if terms.is_empty() {
            return Err(FemError::Input(format!("{context} has no terms")));
        }

        let rhs_json = &constraint_json["rhs"];
        let rhs = if rhs_json.is_array() {
            rhs_json
                .members()
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| FemError::Input(format!("Non-numeric rhs in {context}")))
                })
                .collect::<Result<Vec<f64>>>()?
        } else {
            vec![optional_f64(constraint_json, "rhs", &context)?.unwrap_or(0.0)]
        };

        mesh.add_constraint(MultiFreedomConstraint { terms, rhs });
    }
    Ok(())
}

fn parse_landmarks<const D: usize>(input_json: &JsonValue, mesh: &mut Mesh<D>) -> Result<()> {
    for (i, landmark_json) in input_json["landmarks"].members().enumerate() {
        let context = format!("landmark {i}");
        let weight = field_f64(landmark_json, "weight", &context)?;
        if !(weight > 0.0) {
            return Err(FemError::Input(format!("{context} needs a positive weight")));
        }
        mesh.add_load(Load::Landmark {
            source: parse_point(&landmark_json["source"], &format!("{context} source"))?,
            target: parse_point(&landmark_json["target"], &format!("{context} target"))?,
            weight,
        });
    }
    Ok(())
}

fn parse_grid<const D: usize>(input_json: &JsonValue) -> Result<Option<GridGeometry<D>>> {
    let grid_json = &input_json["grid"];
    if grid_json.is_null() {
        return Ok(None);
    }

    let size_json = &grid_json["size"];
    if !size_json.is_array() || size_json.len() != D {
        return Err(FemError::Input(format!(
            "grid size must be an array of {D} cell counts"
        )));
    }
    let mut size = [0; D];
    for (axis, member) in size_json.members().enumerate() {
        size[axis] = match member.as_usize() {
            Some(s) => s,
            None => return Err(FemError::Input("Non-integer grid size".to_owned())),
        };
    }

    let geometry = if grid_json.has_key("lower") || grid_json.has_key("upper") {
        GridGeometry::from_bounds(
            size,
            parse_point(&grid_json["lower"], "grid lower")?,
            parse_point(&grid_json["upper"], "grid upper")?,
        )?
    } else {
        GridGeometry::from_size(size)?
    };
    Ok(Some(geometry))
}

fn parse_queries<const D: usize>(input_json: &JsonValue) -> Result<Vec<Point<D>>> {
    input_json["queries"]
        .members()
        .enumerate()
        .map(|(i, q)| parse_point(q, &format!("query {i}")))
        .collect()
}

fn finish_problem<const D: usize>(
    input_json: &JsonValue,
    mut mesh: Mesh<D>,
    solution_sets: usize,
) -> Result<Problem<D>> {
    apply_boundary_conditions(input_json, &mut mesh)?;
    parse_constraints(input_json, &mut mesh)?;
    parse_landmarks(input_json, &mut mesh)?;

    let grid = parse_grid(input_json)?;
    let queries = parse_queries(input_json)?;
    if !queries.is_empty() && grid.is_none() {
        return Err(FemError::Input(
            "Input json has queries but no grid section".to_owned(),
        ));
    }

    Ok(Problem {
        mesh,
        config: parse_config(input_json, solution_sets)?,
        grid,
        queries,
    })
}

/// Builds a bar problem from a parsed input file
pub fn build_bar_problem(input_json: &JsonValue) -> Result<Problem<1>> {
    let material = parse_material(input_json, false)?;
    let mesh_json = &input_json["mesh"];
    let mesh = bar_mesh(
        field_f64(mesh_json, "length", "mesh section")?,
        field_usize(mesh_json, "cells", "mesh section")?,
        material,
    )?;
    finish_problem(input_json, mesh, 1)
}

/// Builds a rectangle problem from a parsed input file. Laplace physics
/// solves one scalar field per axis.
pub fn build_rectangle_problem(input_json: &JsonValue) -> Result<Problem<2>> {
    let material = parse_material(input_json, true)?;
    let mesh_json = &input_json["mesh"];
    let physics = match mesh_json["physics"].as_str() {
        None | Some("membrane") => TrianglePhysics::Membrane,
        Some("laplace") => TrianglePhysics::Laplace,
        Some(other) => {
            return Err(FemError::Input(format!(
                "Unknown physics '{other}', expected membrane or laplace"
            )))
        }
    };
    let mesh = rectangle_mesh(
        field_f64(mesh_json, "width", "mesh section")?,
        field_f64(mesh_json, "height", "mesh section")?,
        field_usize(mesh_json, "cells_x", "mesh section")?,
        field_usize(mesh_json, "cells_y", "mesh section")?,
        material,
        physics,
    )?;
    let solution_sets = match physics {
        TrianglePhysics::Membrane => 1,
        TrianglePhysics::Laplace => 2,
    };
    finish_problem(input_json, mesh, solution_sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::compute_element_area;
    use crate::datatypes::Configuration;

    const PLATE: &str = r#"{
        "metadata": { "youngs_modulus": 1000.0, "poisson_ratio": 0.3, "part_thickness": 0.1 },
        "mesh": { "kind": "rectangle", "width": 4.0, "height": 1.0, "cells_x": 4, "cells_y": 1 },
        "boundary_conditions": {
            "wall": { "region": { "x_target_max": 0.01 }, "targets": { "ux": 0.0, "uy": 0.0 } },
            "tip": { "region": { "x_target_min": 3.99 }, "targets": { "fy": -1.0 } }
        },
        "constraints": [
            { "terms": [ { "node": 4, "dof": 1, "coefficient": 1.0 },
                         { "node": 9, "dof": 1, "coefficient": -1.0 } ] }
        ],
        "grid": { "size": [9, 3], "lower": [0.0, 0.0], "upper": [4.0, 1.0] },
        "queries": [ [2.0, 0.5], [10.0, 0.0] ]
    }"#;

    #[test]
    fn rectangle_triangles_are_counter_clockwise() {
        let mesh = rectangle_mesh(2.0, 1.0, 2, 1, LinearElasticity::default(), TrianglePhysics::Membrane)
            .unwrap();
        assert_eq!(mesh.nodes.len(), 6);
        assert_eq!(mesh.elements.len(), 4);
        for e in 0..mesh.elements.len() {
            let coords = mesh.element_coordinates(e, Configuration::Reference).unwrap();
            assert!((compute_element_area(&coords) - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn bar_nodes_are_evenly_spaced() {
        let mesh = bar_mesh(3.0, 3, LinearElasticity::default()).unwrap();
        assert_eq!(mesh.nodes[2].position, Vector1::new(2.0));
        assert!(matches!(
            bar_mesh(0.0, 3, LinearElasticity::default()),
            Err(FemError::Input(_))
        ));
    }

    #[test]
    fn plate_problem_is_loaded() {
        let input = parse_input(PLATE).unwrap();
        assert_eq!(mesh_kind(&input).unwrap(), MeshKind::Rectangle);
        let problem = build_rectangle_problem(&input).unwrap();

        // two wall nodes, two dofs each
        assert_eq!(problem.mesh.boundary_conditions.len(), 4);
        assert_eq!(problem.mesh.loads.len(), 2);
        assert_eq!(problem.mesh.constraints.len(), 1);
        assert_eq!(problem.mesh.constraints[0].rhs, vec![0.0]);
        assert_eq!(problem.config.solution_sets, 1);
        assert_eq!(problem.queries.len(), 2);
        assert_eq!(problem.grid.unwrap().size, [9, 3]);
        assert_eq!(problem.mesh.elements.len(), 8);
    }

    #[test]
    fn laplace_axes_map_to_solution_sets() {
        let input = parse_input(
            r#"{
            "metadata": { "youngs_modulus": 1.0, "poisson_ratio": 0.0, "part_thickness": 1.0 },
            "mesh": { "kind": "rectangle", "physics": "laplace", "width": 1.0, "height": 1.0, "cells_x": 1, "cells_y": 1 },
            "boundary_conditions": {
                "bottom": { "region": { "y_target_max": 0.01 }, "targets": { "uy": 0.0 } }
            }
        }"#,
        )
        .unwrap();
        let problem = build_rectangle_problem(&input).unwrap();
        assert_eq!(problem.config.solution_sets, 2);
        assert!(problem
            .mesh
            .boundary_conditions
            .iter()
            .all(|bc| bc.dof == 0 && bc.dim == Some(1)));
        assert_eq!(problem.mesh.boundary_conditions.len(), 2);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(parse_input("{"), Err(FemError::Input(_))));
        assert!(matches!(
            parse_input(r#"{ "mesh": {}, "boundary_conditions": {} }"#),
            Err(FemError::Input(_))
        ));

        let over = parse_input(
            r#"{
            "metadata": { "youngs_modulus": 1.0, "poisson_ratio": 0.0 },
            "mesh": { "kind": "bar", "length": 1.0, "cells": 2 },
            "boundary_conditions": {
                "end": { "region": {}, "targets": { "ux": 0.0, "fx": 1.0 } }
            }
        }"#,
        )
        .unwrap();
        assert!(matches!(build_bar_problem(&over), Err(FemError::Input(_))));

        let unknown = parse_input(
            r#"{ "metadata": {}, "mesh": { "kind": "sphere" }, "boundary_conditions": {} }"#,
        )
        .unwrap();
        assert!(matches!(mesh_kind(&unknown), Err(FemError::Input(_))));
    }
}
