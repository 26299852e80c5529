//! Global freedom numbering.
//!
//! Every scalar DOF of the mesh receives a dense global freedom number (GFN)
//! in `[0, NGFN)`. Numbers are handed out while walking the elements in
//! order and each element's nodes in connectivity order; nodes no element
//! touches are numbered afterwards in node order. The mapping is therefore a
//! pure function of the mesh's traversal order.

use crate::{
    error::{FemError, Result},
    mesh::Mesh,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofMap {
    /// First GFN of each node; a node's DOFs are numbered consecutively
    first: Vec<usize>,
    /// DOF count of each node
    counts: Vec<usize>,
    ngfn: usize,
}

impl DofMap {
    /// Numbers every DOF of the mesh.
    ///
    /// Fails if a node declares zero DOFs, an element references a node
    /// outside the mesh, or an element expects a different DOF count than
    /// one of its nodes declares.
    pub fn assign<const D: usize>(mesh: &Mesh<D>) -> Result<DofMap> {
        for (index, node) in mesh.nodes.iter().enumerate() {
            if node.dofs == 0 {
                return Err(FemError::InvalidMesh(format!(
                    "node {} declares zero degrees of freedom",
                    index
                )));
            }
        }

        let mut first: Vec<Option<usize>> = vec![None; mesh.nodes.len()];
        let mut next: usize = 0;

        for (e, element) in mesh.elements.iter().enumerate() {
            for &n in element.node_ids() {
                let node = match mesh.nodes.get(n) {
                    Some(node) => node,
                    None => {
                        return Err(FemError::InvalidMesh(format!(
                            "element {} references node {} but the mesh has {} nodes",
                            e,
                            n,
                            mesh.nodes.len()
                        )))
                    }
                };
                if node.dofs != element.dofs_per_node() {
                    return Err(FemError::InvalidMesh(format!(
                        "element {} expects {} dofs per node but node {} declares {}",
                        e,
                        element.dofs_per_node(),
                        n,
                        node.dofs
                    )));
                }
                if first[n].is_none() {
                    first[n] = Some(next);
                    next += node.dofs;
                }
            }
        }

        // free-standing nodes
        for (n, node) in mesh.nodes.iter().enumerate() {
            if first[n].is_none() {
                first[n] = Some(next);
                next += node.dofs;
            }
        }

        Ok(DofMap {
            first: first.into_iter().map(|f| f.unwrap_or(0)).collect(),
            counts: mesh.nodes.iter().map(|n| n.dofs).collect(),
            ngfn: next,
        })
    }

    /// Number of global freedoms
    pub fn ngfn(&self) -> usize {
        self.ngfn
    }

    pub fn n_nodes(&self) -> usize {
        self.first.len()
    }

    /// DOF count of a node, `None` for an unknown node
    pub fn dofs_of(&self, node: usize) -> Option<usize> {
        self.counts.get(node).copied()
    }

    /// GFN of DOF `dof` of node `node`
    pub fn gfn(&self, node: usize, dof: usize) -> Result<usize> {
        match (self.first.get(node), self.counts.get(node)) {
            (Some(first), Some(count)) if dof < *count => Ok(first + dof),
            (Some(_), Some(count)) => Err(FemError::InvalidMesh(format!(
                "node {} has {} dofs, dof {} requested",
                node, count, dof
            ))),
            _ => Err(FemError::InvalidMesh(format!(
                "node {} is not part of the mesh ({} nodes)",
                node,
                self.first.len()
            ))),
        }
    }

    /// GFNs of an element's local DOFs, node-major
    pub fn element_gfns(&self, node_ids: &[usize]) -> Result<Vec<usize>> {
        let mut gfns = Vec::new();
        for &n in node_ids {
            let count = match self.counts.get(n) {
                Some(c) => *c,
                None => {
                    return Err(FemError::InvalidMesh(format!(
                        "node {} is not part of the mesh ({} nodes)",
                        n,
                        self.first.len()
                    )))
                }
            };
            for k in 0..count {
                gfns.push(self.first[n] + k);
            }
        }
        Ok(gfns)
    }
}
