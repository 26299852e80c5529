use crate::{
    datatypes::{BoundaryCondition, Configuration, Load, MultiFreedomConstraint, Node, Point},
    element::Element,
    error::{FemError, Result},
};

/// The finite element model: nodes, elements, loads and constraints.
///
/// Elements refer to nodes by index. Connectivity is validated when DOFs are
/// numbered, not when elements are added, so a mesh can be built in any
/// order.
pub struct Mesh<const D: usize> {
    pub nodes: Vec<Node<D>>,
    pub elements: Vec<Box<dyn Element<D>>>,
    pub loads: Vec<Load<D>>,
    pub boundary_conditions: Vec<BoundaryCondition>,
    pub constraints: Vec<MultiFreedomConstraint>,
}

impl<const D: usize> Default for Mesh<D> {
    fn default() -> Self {
        Mesh::new()
    }
}

impl<const D: usize> Mesh<D> {
    pub fn new() -> Mesh<D> {
        Mesh {
            nodes: Vec::new(),
            elements: Vec::new(),
            loads: Vec::new(),
            boundary_conditions: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Adds a node and returns its index
    pub fn add_node(&mut self, position: Point<D>, dofs: usize) -> usize {
        self.nodes.push(Node::new(position, dofs));
        self.nodes.len() - 1
    }

    /// Adds an element and returns its index
    pub fn add_element<E: Element<D> + 'static>(&mut self, element: E) -> usize {
        self.elements.push(Box::new(element));
        self.elements.len() - 1
    }

    pub fn add_load(&mut self, load: Load<D>) {
        self.loads.push(load);
    }

    pub fn add_boundary_condition(&mut self, bc: BoundaryCondition) {
        self.boundary_conditions.push(bc);
    }

    pub fn add_constraint(&mut self, mfc: MultiFreedomConstraint) {
        self.constraints.push(mfc);
    }

    pub fn element(&self, index: usize) -> Result<&dyn Element<D>> {
        match self.elements.get(index) {
            Some(e) => Ok(e.as_ref()),
            None => Err(FemError::InvalidMesh(format!(
                "element index {} out of bounds (mesh has {} elements)",
                index,
                self.elements.len()
            ))),
        }
    }

    /// Positions of an element's nodes in the requested configuration
    pub fn element_coordinates(
        &self,
        index: usize,
        configuration: Configuration,
    ) -> Result<Vec<Point<D>>> {
        let element = self.element(index)?;
        element
            .node_ids()
            .iter()
            .map(|&n| match self.nodes.get(n) {
                Some(node) => Ok(node.position_in(configuration)),
                None => Err(FemError::InvalidMesh(format!(
                    "element {} references node {} but the mesh has {} nodes",
                    index,
                    n,
                    self.nodes.len()
                ))),
            })
            .collect()
    }

    /// Finds the first element, in element order, containing `point`
    pub fn locate(
        &self,
        point: &Point<D>,
        configuration: Configuration,
    ) -> Result<Option<(usize, nalgebra::DVector<f64>)>> {
        for (index, element) in self.elements.iter().enumerate() {
            let coords = self.element_coordinates(index, configuration)?;
            if let Some(local) = element.local_coordinates(&coords, point) {
                return Ok(Some((index, local)));
            }
        }
        Ok(None)
    }

    /// Clears every node's solved values
    pub fn reset_solution(&mut self) {
        for node in self.nodes.iter_mut() {
            node.solution.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{LinearElasticity, Triangle3};
    use nalgebra::Vector2;

    fn two_triangles() -> Mesh<2> {
        let mut mesh = Mesh::new();
        mesh.add_node(Vector2::new(0.0, 0.0), 2);
        mesh.add_node(Vector2::new(1.0, 0.0), 2);
        mesh.add_node(Vector2::new(1.0, 1.0), 2);
        mesh.add_node(Vector2::new(0.0, 1.0), 2);
        let material = LinearElasticity::default();
        mesh.add_element(Triangle3::membrane([0, 1, 2], material));
        mesh.add_element(Triangle3::membrane([0, 2, 3], material));
        mesh
    }

    #[test]
    fn locate_returns_first_containing_element() {
        let mesh = two_triangles();
        let (index, _) = mesh
            .locate(&Vector2::new(0.75, 0.25), Configuration::Reference)
            .unwrap()
            .unwrap();
        assert_eq!(index, 0);
        let (index, _) = mesh
            .locate(&Vector2::new(0.25, 0.75), Configuration::Reference)
            .unwrap()
            .unwrap();
        assert_eq!(index, 1);
        // on the shared diagonal the first element wins
        let (index, _) = mesh
            .locate(&Vector2::new(0.5, 0.5), Configuration::Reference)
            .unwrap()
            .unwrap();
        assert_eq!(index, 0);
        assert!(mesh
            .locate(&Vector2::new(1.5, 0.5), Configuration::Reference)
            .unwrap()
            .is_none());
    }

    #[test]
    fn deformed_coordinates_follow_displacement() {
        let mut mesh = two_triangles();
        mesh.nodes[1].solution = vec![0.5, 0.0];
        let coords = mesh.element_coordinates(0, Configuration::Deformed).unwrap();
        assert_eq!(coords[1], Vector2::new(1.5, 0.0));
        mesh.reset_solution();
        let coords = mesh.element_coordinates(0, Configuration::Deformed).unwrap();
        assert_eq!(coords[1], Vector2::new(1.0, 0.0));
    }

    #[test]
    fn dangling_node_reference_is_reported() {
        let mut mesh = two_triangles();
        mesh.add_element(Triangle3::membrane([0, 1, 9], LinearElasticity::default()));
        assert!(matches!(
            mesh.element_coordinates(2, Configuration::Reference),
            Err(FemError::InvalidMesh(_))
        ));
    }
}
