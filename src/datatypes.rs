use nalgebra::SVector;

/// A point (or vector) in `D`-dimensional physical space
pub type Point<const D: usize> = SVector<f64, D>;

/// Which node positions element geometry is evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configuration {
    /// Undeformed node positions
    Reference,
    /// Node positions plus their current displacement
    Deformed,
}

#[derive(Debug, Clone)]
pub struct Node<const D: usize> {
    pub position: Point<D>,
    /// Number of scalar degrees of freedom carried by the node
    pub dofs: usize,
    /// Solved values, flattened as `set * dofs + dof`
    pub solution: Vec<f64>,
}

impl<const D: usize> Node<D> {
    pub fn new(position: Point<D>, dofs: usize) -> Node<D> {
        Node {
            position,
            dofs,
            solution: Vec::new(),
        }
    }

    /// Solved value of one DOF in one solution set, zero if not solved yet
    pub fn solution_value(&self, set: usize, dof: usize) -> f64 {
        self.solution
            .get(set * self.dofs + dof)
            .copied()
            .unwrap_or(0.0)
    }

    /// The spatial displacement of the node.
    ///
    /// Component `c` is the `c`-th flattened solution value. For vector
    /// elements (`dofs == D`, one set) that is DOF `c` of set 0; for isotropic
    /// elements (`dofs == 1`, `D` sets) it is DOF 0 of set `c`.
    pub fn displacement(&self) -> Point<D> {
        Point::<D>::from_fn(|c, _| self.solution.get(c).copied().unwrap_or(0.0))
    }

    pub fn position_in(&self, configuration: Configuration) -> Point<D> {
        match configuration {
            Configuration::Reference => self.position,
            Configuration::Deformed => self.position + self.displacement(),
        }
    }
}

/// Maps a (solution set, local DOF) pair to a spatial component, if any
pub fn spatial_component<const D: usize>(set: usize, dof: usize, dofs: usize) -> Option<usize> {
    let c = set * dofs + dof;
    if c < D {
        Some(c)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Load<const D: usize> {
    /// Force applied directly at the DOFs of a node, one entry per local DOF
    Nodal {
        node: usize,
        force: Vec<f64>,
        dim: Option<usize>,
    },
    /// Load per unit measure spread over an element with its shape functions
    Element {
        element: usize,
        intensity: Vec<f64>,
        dim: Option<usize>,
    },
    /// Penalty spring pulling the material point at `source` towards `target`
    Landmark {
        source: Point<D>,
        target: Point<D>,
        weight: f64,
    },
}

impl<const D: usize> Load<D> {
    /// Whether the load contributes to the given solution set
    pub fn applies_to(&self, set: usize) -> bool {
        match self {
            Load::Nodal { dim, .. } | Load::Element { dim, .. } => dim.map_or(true, |d| d == set),
            Load::Landmark { .. } => true,
        }
    }
}

/// Essential boundary condition prescribing the value of one DOF
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCondition {
    pub node: usize,
    pub dof: usize,
    pub value: f64,
    /// Solution set the condition is active in, `None` for all of them
    pub dim: Option<usize>,
}

impl BoundaryCondition {
    pub fn fixed(node: usize, dof: usize, value: f64) -> BoundaryCondition {
        BoundaryCondition {
            node,
            dof,
            value,
            dim: None,
        }
    }

    pub fn is_active(&self, set: usize) -> bool {
        self.dim.map_or(true, |d| d == set)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MfcTerm {
    pub node: usize,
    pub dof: usize,
    pub coefficient: f64,
}

/// Linear equality `Σ cᵢ·uᵢ = rhs` over a handful of DOFs
#[derive(Debug, Clone, PartialEq)]
pub struct MultiFreedomConstraint {
    pub terms: Vec<MfcTerm>,
    /// Right-hand side per solution set; a single entry applies to every set
    pub rhs: Vec<f64>,
}

impl MultiFreedomConstraint {
    pub fn new(terms: Vec<MfcTerm>, rhs: f64) -> MultiFreedomConstraint {
        MultiFreedomConstraint {
            terms,
            rhs: vec![rhs],
        }
    }

    pub fn rhs_for(&self, set: usize) -> f64 {
        match self.rhs.get(set) {
            Some(v) => *v,
            None => self.rhs.first().copied().unwrap_or(0.0),
        }
    }
}
