use nalgebra::{matrix, DMatrix, DVector, Matrix2, SMatrix, Vector2};

use crate::datatypes::Point;

/// Tolerance used when deciding whether a point lies on an element boundary
pub const CONTAINS_TOL: f64 = 1e-10;

/// Capability contract every finite element satisfies.
///
/// Local DOFs are ordered node-major: local index `n * dofs_per_node + k`
/// is DOF `k` of the element's `n`-th node. `coords` always holds one point
/// per element node, in the same order as `node_ids`.
pub trait Element<const D: usize> {
    /// Mesh indices of the element's nodes
    fn node_ids(&self) -> &[usize];

    fn dofs_per_node(&self) -> usize;

    fn n_dofs(&self) -> usize {
        self.node_ids().len() * self.dofs_per_node()
    }

    /// Local stiffness matrix of size `n_dofs x n_dofs`
    fn stiffness_matrix(&self, coords: &[Point<D>]) -> DMatrix<f64>;

    /// Local coordinates of a global point, or `None` when the point is
    /// outside the element
    fn local_coordinates(&self, coords: &[Point<D>], point: &Point<D>) -> Option<DVector<f64>>;

    /// Shape function values at a local point, one per node
    fn shape_functions(&self, local: &DVector<f64>) -> DVector<f64>;

    /// Integral of each shape function over the element volume
    fn shape_function_integrals(&self, coords: &[Point<D>]) -> DVector<f64>;

    fn contains_point(&self, coords: &[Point<D>], point: &Point<D>) -> bool {
        self.local_coordinates(coords, point).is_some()
    }

    /// Interpolates nodal vectors at a local point
    fn interpolate(&self, local: &DVector<f64>, nodal_values: &[Point<D>]) -> Point<D> {
        let shape = self.shape_functions(local);
        nodal_values
            .iter()
            .zip(shape.iter())
            .fold(Point::<D>::zeros(), |acc, (v, n)| acc + v * *n)
    }
}

/// Linear elastic material properties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearElasticity {
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
    /// Cross section area of bar elements
    pub cross_section_area: f64,
    /// Thickness of planar elements
    pub thickness: f64,
}

impl Default for LinearElasticity {
    fn default() -> Self {
        LinearElasticity {
            youngs_modulus: 1.0,
            poisson_ratio: 0.0,
            cross_section_area: 1.0,
            thickness: 1.0,
        }
    }
}

/// Two node bar along the only axis of a 1D mesh, one DOF per node
#[derive(Debug, Clone)]
pub struct Bar1D {
    pub nodes: [usize; 2],
    pub material: LinearElasticity,
}

impl Bar1D {
    pub fn new(nodes: [usize; 2], material: LinearElasticity) -> Bar1D {
        Bar1D { nodes, material }
    }

    fn length(coords: &[Point<1>]) -> f64 {
        (coords[1][0] - coords[0][0]).abs()
    }
}

impl Element<1> for Bar1D {
    fn node_ids(&self) -> &[usize] {
        &self.nodes
    }

    fn dofs_per_node(&self) -> usize {
        1
    }

    fn stiffness_matrix(&self, coords: &[Point<1>]) -> DMatrix<f64> {
        let k = self.material.youngs_modulus * self.material.cross_section_area
            / Bar1D::length(coords);
        DMatrix::from_row_slice(2, 2, &[k, -k, -k, k])
    }

    fn local_coordinates(&self, coords: &[Point<1>], point: &Point<1>) -> Option<DVector<f64>> {
        let span = coords[1][0] - coords[0][0];
        if span.abs() < f64::EPSILON {
            return None;
        }
        let xi = (point[0] - coords[0][0]) / span;
        if xi < -CONTAINS_TOL || xi > 1.0 + CONTAINS_TOL {
            return None;
        }
        Some(DVector::from_element(1, xi))
    }

    fn shape_functions(&self, local: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![1.0 - local[0], local[0]])
    }

    fn shape_function_integrals(&self, coords: &[Point<1>]) -> DVector<f64> {
        let half = 0.5 * Bar1D::length(coords) * self.material.cross_section_area;
        DVector::from_vec(vec![half, half])
    }
}

/// Physics carried by a linear triangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrianglePhysics {
    /// Plane stress membrane, two in-plane DOFs per node
    Membrane,
    /// Isotropic scalar field (Laplace operator), one DOF per node
    Laplace,
}

/// Constant strain triangle
#[derive(Debug, Clone)]
pub struct Triangle3 {
    pub nodes: [usize; 3],
    pub material: LinearElasticity,
    pub physics: TrianglePhysics,
}

impl Triangle3 {
    pub fn membrane(nodes: [usize; 3], material: LinearElasticity) -> Triangle3 {
        Triangle3 {
            nodes,
            material,
            physics: TrianglePhysics::Membrane,
        }
    }

    pub fn laplace(nodes: [usize; 3], material: LinearElasticity) -> Triangle3 {
        Triangle3 {
            nodes,
            material,
            physics: TrianglePhysics::Laplace,
        }
    }
}

/// Signed area of a triangle, positive for counter-clockwise node order
pub fn compute_element_area(coords: &[Point<2>]) -> f64 {
    let (v0, v1, v2) = (&coords[0], &coords[1], &coords[2]);

    0.5 * (v0.x * (v1.y - v2.y) + v1.x * (v2.y - v0.y) + v2.x * (v0.y - v1.y))
}

/// Shape function gradients of a linear triangle.
///
/// Row 0 holds `dN/dx`, row 1 holds `dN/dy`.
fn compute_shape_gradients(coords: &[Point<2>], element_area: f64) -> SMatrix<f64, 2, 3> {
    let (v0, v1, v2) = (&coords[0], &coords[1], &coords[2]);

    let beta_1 = v1.y - v2.y;
    let beta_2 = v2.y - v0.y;
    let beta_3 = v0.y - v1.y;

    let gamma_1 = v2.x - v1.x;
    let gamma_2 = v0.x - v2.x;
    let gamma_3 = v1.x - v0.x;

    let gradients: SMatrix<f64, 2, 3> = matrix![
        beta_1, beta_2, beta_3;
        gamma_1, gamma_2, gamma_3;
    ];

    gradients / (2.0 * element_area)
}

/// Calculates the 3x6 strain-displacement matrix of a membrane triangle
pub fn compute_strain_displacement_matrix(
    coords: &[Point<2>],
    element_area: f64,
) -> SMatrix<f64, 3, 6> {
    let g = compute_shape_gradients(coords, element_area);

    matrix![
        g[(0, 0)], 0., g[(0, 1)], 0., g[(0, 2)], 0.;
        0., g[(1, 0)], 0., g[(1, 1)], 0., g[(1, 2)];
        g[(1, 0)], g[(0, 0)], g[(1, 1)], g[(0, 1)], g[(1, 2)], g[(0, 2)];
    ]
}

/// Calculates the plane stress stress-strain matrix
pub fn compute_stress_strain_matrix(poisson_ratio: f64, youngs_modulus: f64) -> SMatrix<f64, 3, 3> {
    let mut stress_strain_mat: SMatrix<f64, 3, 3> = matrix![
        1.0, poisson_ratio, 0.0;
        poisson_ratio, 1.0, 0.0;
        0.0, 0.0, (1.0 - poisson_ratio)/2.0;
    ];

    stress_strain_mat *= youngs_modulus / (1.0 - f64::powi(poisson_ratio, 2));

    stress_strain_mat
}

impl Element<2> for Triangle3 {
    fn node_ids(&self) -> &[usize] {
        &self.nodes
    }

    fn dofs_per_node(&self) -> usize {
        match self.physics {
            TrianglePhysics::Membrane => 2,
            TrianglePhysics::Laplace => 1,
        }
    }

    fn stiffness_matrix(&self, coords: &[Point<2>]) -> DMatrix<f64> {
        let element_area = compute_element_area(coords);
        let volume = element_area.abs() * self.material.thickness;

        match self.physics {
            TrianglePhysics::Membrane => {
                let stress_strain_mat = compute_stress_strain_matrix(
                    self.material.poisson_ratio,
                    self.material.youngs_modulus,
                );
                let strain_displacement_mat =
                    compute_strain_displacement_matrix(coords, element_area);
                let k = (strain_displacement_mat.transpose() * stress_strain_mat)
                    * strain_displacement_mat
                    * volume;
                DMatrix::from_column_slice(6, 6, k.as_slice())
            }
            TrianglePhysics::Laplace => {
                let g = compute_shape_gradients(coords, element_area);
                let k = g.transpose() * g * (self.material.youngs_modulus * volume);
                DMatrix::from_column_slice(3, 3, k.as_slice())
            }
        }
    }

    fn local_coordinates(&self, coords: &[Point<2>], point: &Point<2>) -> Option<DVector<f64>> {
        let edges = Matrix2::from_columns(&[coords[1] - coords[0], coords[2] - coords[0]]);
        let inverse = edges.try_inverse()?;
        let local: Vector2<f64> = inverse * (point - coords[0]);

        let (xi, eta) = (local.x, local.y);
        if xi < -CONTAINS_TOL || eta < -CONTAINS_TOL || xi + eta > 1.0 + CONTAINS_TOL {
            return None;
        }
        Some(DVector::from_vec(vec![xi, eta]))
    }

    fn shape_functions(&self, local: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![1.0 - local[0] - local[1], local[0], local[1]])
    }

    fn shape_function_integrals(&self, coords: &[Point<2>]) -> DVector<f64> {
        let third = compute_element_area(coords).abs() * self.material.thickness / 3.0;
        DVector::from_element(3, third)
    }
}
