use std::collections::HashSet;

use approx::assert_relative_eq;
use nalgebra::{Vector1, Vector2};

use lodestone::{
    mesher::{self, rectangle_mesh},
    solver::ELEMENT_MATRIX,
    BoundaryCondition, Configuration, ConjugateGradientSystem, DofMap, FemError, GridGeometry,
    LinearElasticity, Load, Mesh, MfcTerm, MultiFreedomConstraint, Solver, SolverConfig,
    TrianglePhysics,
};

fn steel() -> LinearElasticity {
    LinearElasticity {
        youngs_modulus: 200.0,
        poisson_ratio: 0.3,
        cross_section_area: 1.0,
        thickness: 0.1,
    }
}

/// 3x3 cell membrane plate clamped on the left edge and pulled on the right
fn clamped_plate() -> Mesh<2> {
    let mut mesh = rectangle_mesh(3.0, 3.0, 3, 3, steel(), TrianglePhysics::Membrane).unwrap();
    for n in 0..mesh.nodes.len() {
        let position = mesh.nodes[n].position;
        if position.x == 0.0 {
            mesh.add_boundary_condition(BoundaryCondition::fixed(n, 0, 0.0));
            mesh.add_boundary_condition(BoundaryCondition::fixed(n, 1, 0.0));
        }
        if position.x == 3.0 {
            mesh.add_load(Load::Nodal {
                node: n,
                force: vec![0.05, -0.02],
                dim: None,
            });
        }
    }
    mesh
}

#[test]
fn single_bar_matches_hand_calculation() {
    let k = 4.0;
    let mut mesh = mesher::bar_mesh(
        1.0,
        1,
        LinearElasticity {
            youngs_modulus: k,
            ..LinearElasticity::default()
        },
    )
    .unwrap();
    mesh.add_boundary_condition(BoundaryCondition::fixed(0, 0, 0.0));
    mesh.add_load(Load::Nodal {
        node: 1,
        force: vec![1.0],
        dim: None,
    });

    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    solver.solve().unwrap();

    let tip = solver.dof_map().unwrap().gfn(1, 0).unwrap();
    assert_relative_eq!(solver.solution(tip, 0).unwrap(), 1.0 / k, epsilon = 1e-12);
    assert_relative_eq!(
        solver.deformation_energy(0).unwrap(),
        1.0 / (2.0 * k),
        epsilon = 1e-12
    );
    drop(solver);
    assert_relative_eq!(mesh.nodes[1].displacement(), Vector1::new(0.25), epsilon = 1e-12);
}

#[test]
fn numbering_is_a_bijection_and_stiffness_is_symmetric() {
    let mut mesh = clamped_plate();
    let map = DofMap::assign(&mesh).unwrap();

    let mut seen = HashSet::new();
    for n in 0..mesh.nodes.len() {
        for dof in 0..mesh.nodes[n].dofs {
            let gfn = map.gfn(n, dof).unwrap();
            assert!(gfn < map.ngfn());
            assert!(seen.insert(gfn));
        }
    }
    assert_eq!(seen.len(), map.ngfn());
    assert_eq!(map.ngfn(), 32);

    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    solver.assemble_k().unwrap();
    let ls = solver.linear_system();
    for i in 0..solver.ngfn() {
        for j in 0..solver.ngfn() {
            assert_relative_eq!(
                ls.matrix_value(i, j, ELEMENT_MATRIX),
                ls.matrix_value(j, i, ELEMENT_MATRIX),
                epsilon = 1e-9
            );
        }
    }
}

#[test]
fn deformed_plate_is_found_through_the_grid() {
    let mut mesh = clamped_plate();
    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    solver
        .initialize_interpolation_grid(
            GridGeometry::from_bounds([13, 13], Vector2::new(-0.5, -0.5), Vector2::new(3.5, 3.5))
                .unwrap(),
        )
        .unwrap();
    solver.solve().unwrap();

    // top right corner: stretched along x, sagging under the load
    let corner = solver.mesh().nodes[15].displacement();
    assert!(corner.x > 0.0);
    assert!(corner.y < 0.0);

    for e in 0..solver.mesh().elements.len() {
        let coords = solver
            .mesh()
            .element_coordinates(e, Configuration::Deformed)
            .unwrap();
        let centroid = (coords[0] + coords[1] + coords[2]) / 3.0;
        assert_eq!(solver.element_at_point(&centroid).unwrap(), Some(e));

        let reference = solver
            .mesh()
            .element_coordinates(e, Configuration::Reference)
            .unwrap();
        let expected = solver
            .mesh()
            .element(e)
            .unwrap()
            .node_ids()
            .iter()
            .map(|&n| solver.mesh().nodes[n].displacement())
            .fold(Vector2::zeros(), |acc, u| acc + u)
            / 3.0;
        assert_relative_eq!(
            solver.interpolate_displacement(&centroid).unwrap().unwrap(),
            expected,
            epsilon = 1e-9
        );
        assert_ne!(centroid, (reference[0] + reference[1] + reference[2]) / 3.0);
    }

    // the grid holds exactly the first deformed element around each cell centre
    let grid = solver.interpolation_grid().unwrap();
    let mut owned = vec![0; solver.mesh().elements.len()];
    for i in 0..13 {
        for j in 0..13 {
            let centre = grid.geometry().point_at(&[i, j]);
            let first = (0..solver.mesh().elements.len()).find(|&e| {
                let coords = solver
                    .mesh()
                    .element_coordinates(e, Configuration::Deformed)
                    .unwrap();
                solver.mesh().element(e).unwrap().contains_point(&coords, &centre)
            });
            assert_eq!(grid.cell(&[i, j]), first);
            if let Some(e) = first {
                owned[e] += 1;
            }
        }
    }
    assert!(owned.iter().all(|&n| n > 0));
}

#[test]
fn stretched_bar_refills_the_grid() {
    let mut mesh = mesher::bar_mesh(4.0, 4, LinearElasticity::default()).unwrap();
    mesh.add_boundary_condition(BoundaryCondition::fixed(0, 0, 0.0));
    mesh.add_boundary_condition(BoundaryCondition::fixed(4, 0, 4.0));

    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    solver
        .initialize_interpolation_grid(
            GridGeometry::from_bounds([17], Vector1::new(0.0), Vector1::new(8.0)).unwrap(),
        )
        .unwrap();
    // reference bar only reaches x = 4
    assert_eq!(solver.interpolation_grid().unwrap().cell(&[12]), None);

    solver.solve().unwrap();

    // deformed nodes sit at 0, 2, 4, 6 and 8
    let grid = solver.interpolation_grid().unwrap();
    assert_eq!(grid.occupied_cells(), 17);
    assert_eq!(grid.cell(&[0]), Some(0));
    assert_eq!(grid.cell(&[4]), Some(0));
    assert_eq!(grid.cell(&[5]), Some(1));
    assert_eq!(grid.cell(&[12]), Some(2));
    assert_eq!(grid.cell(&[16]), Some(3));

    let point = Vector1::new(5.0);
    assert_eq!(solver.element_at_point(&point).unwrap(), Some(2));
    assert_relative_eq!(
        solver.interpolate_displacement(&point).unwrap().unwrap()[0],
        2.5,
        epsilon = 1e-9
    );
}

#[test]
fn points_outside_the_mesh_have_no_element() {
    let mut mesh = clamped_plate();
    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    solver
        .initialize_interpolation_grid(
            GridGeometry::from_bounds([21, 21], Vector2::new(-1.0, -1.0), Vector2::new(4.0, 4.0))
                .unwrap(),
        )
        .unwrap();
    solver.solve().unwrap();

    // inside the grid but outside the deformed plate
    assert_eq!(solver.element_at_point(&Vector2::new(-0.5, 1.0)).unwrap(), None);
    assert_eq!(solver.interpolate_displacement(&Vector2::new(1.5, 3.8)).unwrap(), None);
    // outside the grid
    assert_eq!(solver.element_at_point(&Vector2::new(10.0, 1.0)).unwrap(), None);

    let inside = Vector2::new(1.4, 1.6);
    let e = solver.element_at_point(&inside).unwrap().unwrap();
    let coords = solver
        .mesh()
        .element_coordinates(e, Configuration::Deformed)
        .unwrap();
    assert!(solver.mesh().element(e).unwrap().contains_point(&coords, &inside));
}

#[test]
fn contradictory_constraints_are_rejected() {
    let mut mesh = mesher::bar_mesh(2.0, 2, LinearElasticity::default()).unwrap();
    let pin = |rhs| {
        MultiFreedomConstraint::new(
            vec![MfcTerm {
                node: 0,
                dof: 0,
                coefficient: 1.0,
            }],
            rhs,
        )
    };
    mesh.add_constraint(pin(1.0));
    mesh.add_constraint(pin(2.0));

    let mut solver = Solver::new(&mut mesh, SolverConfig::default());
    assert!(matches!(solver.solve(), Err(FemError::ConstraintConflict(_))));
}

#[test]
fn dense_and_conjugate_gradient_agree() {
    let mut dense_mesh = clamped_plate();
    let mut dense = Solver::new(&mut dense_mesh, SolverConfig::default());
    dense.solve().unwrap();

    let mut cg_mesh = clamped_plate();
    let mut backend = ConjugateGradientSystem::new(1e-12, 10_000);
    let mut cg = Solver::with_backend(&mut cg_mesh, &mut backend, SolverConfig::default());
    cg.solve().unwrap();

    assert_eq!(dense.ngfn(), cg.ngfn());
    for gfn in 0..dense.ngfn() {
        assert_relative_eq!(
            dense.solution(gfn, 0).unwrap(),
            cg.solution(gfn, 0).unwrap(),
            epsilon = 1e-7
        );
    }
}

#[test]
fn json_bar_problem_runs_end_to_end() {
    let input = mesher::parse_input(
        r#"{
        "metadata": { "youngs_modulus": 2.0, "poisson_ratio": 0.0 },
        "mesh": { "kind": "bar", "length": 3.0, "cells": 3 },
        "boundary_conditions": {
            "root": { "region": { "x_target_max": 0.1 }, "targets": { "ux": 0.0 } },
            "tip": { "region": { "x_target_min": 2.9 }, "targets": { "fx": 1.0 } }
        },
        "grid": { "size": [7], "lower": [0.0], "upper": [6.0] },
        "queries": [ [2.25] ]
    }"#,
    )
    .unwrap();
    let problem = mesher::build_bar_problem(&input).unwrap();
    let mut mesh = problem.mesh;
    let mut solver = Solver::new(&mut mesh, problem.config);
    solver.initialize_interpolation_grid(problem.grid.unwrap()).unwrap();
    solver.solve().unwrap();

    // three springs of stiffness 2 in series stretch the tip by 1.5
    assert_relative_eq!(solver.mesh().nodes[3].displacement()[0], 1.5, epsilon = 1e-12);
    // deformed nodes sit at 0, 1.5, 3 and 4.5, so x = 2.25 is the midpoint
    // of the middle element
    let query = problem.queries[0];
    assert_eq!(solver.element_at_point(&query).unwrap(), Some(1));
    assert_relative_eq!(
        solver.interpolate_displacement(&query).unwrap().unwrap()[0],
        0.75,
        epsilon = 1e-12
    );
}
