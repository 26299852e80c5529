//! Linear finite element assembly and solution with a spatial lookup grid.
//!
//! A [`Solver`] borrows a [`Mesh`], numbers its degrees of freedom, assembles
//! element stiffness, landmark springs and multi-freedom constraints into a
//! pluggable [`LinearSystem`], applies essential boundary conditions and
//! solves one or more load cases. Solved displacements are written back to
//! the nodes. An [`InterpolationGrid`] then maps physical points of the
//! deformed mesh to the elements containing them.

pub mod assembly;
pub mod constraints;
pub mod datatypes;
pub mod dof;
pub mod element;
pub mod error;
pub mod grid;
pub mod linear_system;
pub mod mesh;
pub mod mesher;
pub mod post_processor;
pub mod solver;

pub use assembly::MfcStrategy;
pub use datatypes::{
    BoundaryCondition, Configuration, Load, MfcTerm, MultiFreedomConstraint, Node, Point,
};
pub use dof::DofMap;
pub use element::{Bar1D, Element, LinearElasticity, Triangle3, TrianglePhysics};
pub use error::{FemError, Result};
pub use grid::{GridGeometry, InterpolationGrid};
pub use linear_system::{ConjugateGradientSystem, DenseLinearSystem, LinearSystem};
pub use mesh::Mesh;
pub use solver::{Solver, SolverConfig};
