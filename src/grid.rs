//! Structured spatial index over the (possibly deformed) mesh.
//!
//! Every grid cell remembers the element occupying its centre point. Cells
//! are stored in a flat array with row-major strides (last axis fastest).

use log::info;
use nalgebra::SMatrix;

use crate::{
    assembly::progress_bar,
    datatypes::{Configuration, Point},
    error::{FemError, Result},
    mesh::Mesh,
};

/// Allowed deviation of `directionᵀ·direction` from the identity
pub const ORTHONORMAL_TOL: f64 = 1e-9;
/// Slack, in index units, when deciding which cell centres an element covers
const FILL_TOL: f64 = 1e-9;

/// Placement of a structured grid in physical space
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry<const D: usize> {
    /// Number of cells along each axis
    pub size: [usize; D],
    /// Physical position of cell `[0; D]`
    pub origin: Point<D>,
    /// Distance between neighbouring cell centres along each axis
    pub spacing: Point<D>,
    /// Orthonormal matrix whose columns are the grid axes
    pub direction: SMatrix<f64, D, D>,
}

impl<const D: usize> GridGeometry<D> {
    pub fn new(
        size: [usize; D],
        origin: Point<D>,
        spacing: Point<D>,
        direction: SMatrix<f64, D, D>,
    ) -> Result<GridGeometry<D>> {
        if let Some(axis) = size.iter().position(|s| *s == 0) {
            return Err(FemError::InvalidGrid(format!("axis {} has no cells", axis)));
        }
        if let Some(axis) = spacing.iter().position(|s| !(*s > 0.0 && s.is_finite())) {
            return Err(FemError::InvalidGrid(format!(
                "spacing {} along axis {} is not positive",
                spacing[axis], axis
            )));
        }
        let deviation = (direction.transpose() * direction - SMatrix::<f64, D, D>::identity()).amax();
        if !(deviation <= ORTHONORMAL_TOL) {
            return Err(FemError::InvalidGrid(format!(
                "direction matrix is not orthonormal (deviation {:e})",
                deviation
            )));
        }

        Ok(GridGeometry {
            size,
            origin,
            spacing,
            direction,
        })
    }

    /// Axis-aligned grid whose first and last cell centres sit on `lower`
    /// and `upper`. A single-cell axis gets unit spacing.
    pub fn from_bounds(size: [usize; D], lower: Point<D>, upper: Point<D>) -> Result<GridGeometry<D>> {
        let spacing = Point::<D>::from_fn(|i, _| {
            if size[i] > 1 {
                (upper[i] - lower[i]) / (size[i] - 1) as f64
            } else {
                1.0
            }
        });
        GridGeometry::new(size, lower, spacing, SMatrix::<f64, D, D>::identity())
    }

    /// Unit-spaced grid covering `0 ..= size - 1` on every axis
    pub fn from_size(size: [usize; D]) -> Result<GridGeometry<D>> {
        let upper = Point::<D>::from_fn(|i, _| size[i].saturating_sub(1) as f64);
        GridGeometry::from_bounds(size, Point::<D>::zeros(), upper)
    }

    pub fn n_cells(&self) -> usize {
        self.size.iter().product()
    }

    /// Physical centre of a cell
    pub fn point_at(&self, index: &[usize; D]) -> Point<D> {
        let scaled = Point::<D>::from_fn(|i, _| index[i] as f64 * self.spacing[i]);
        self.origin + self.direction * scaled
    }

    /// Fractional grid index of a physical point
    pub fn continuous_index(&self, point: &Point<D>) -> Point<D> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }

    /// Nearest cell to a physical point, `None` outside the grid
    pub fn index_of(&self, point: &Point<D>) -> Option<[usize; D]> {
        let continuous = self.continuous_index(point);
        let mut index = [0; D];
        for axis in 0..D {
            let rounded = continuous[axis].round();
            if !(rounded >= 0.0 && rounded < self.size[axis] as f64) {
                return None;
            }
            index[axis] = rounded as usize;
        }
        Some(index)
    }
}

/// Visits every index in the inclusive box `lo ..= hi`
fn for_each_in_box<const D: usize>(lo: [usize; D], hi: [usize; D], mut visit: impl FnMut(&[usize; D])) {
    let mut index = lo;
    loop {
        visit(&index);
        let mut axis = D;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            if index[axis] < hi[axis] {
                index[axis] += 1;
                break;
            }
            index[axis] = lo[axis];
        }
    }
}

fn flat_index<const D: usize>(strides: &[usize; D], index: &[usize; D]) -> usize {
    strides.iter().zip(index.iter()).map(|(s, i)| s * i).sum()
}

/// Cell-to-element map over a [`GridGeometry`]
#[derive(Debug, Clone)]
pub struct InterpolationGrid<const D: usize> {
    geometry: GridGeometry<D>,
    strides: [usize; D],
    cells: Vec<Option<usize>>,
}

impl<const D: usize> InterpolationGrid<D> {
    /// Creates a grid with every cell empty
    pub fn new(geometry: GridGeometry<D>) -> InterpolationGrid<D> {
        let mut strides = [1; D];
        for axis in (0..D.saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * geometry.size[axis + 1];
        }
        let cells = vec![None; geometry.n_cells()];
        InterpolationGrid {
            geometry,
            strides,
            cells,
        }
    }

    pub fn geometry(&self) -> &GridGeometry<D> {
        &self.geometry
    }

    /// Element stored in a cell
    pub fn cell(&self, index: &[usize; D]) -> Option<usize> {
        if index.iter().zip(self.geometry.size.iter()).any(|(i, s)| i >= s) {
            return None;
        }
        self.cells[flat_index(&self.strides, index)]
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Inclusive range of cells whose centres may lie inside the element
    fn covered_cells(&self, coords: &[Point<D>]) -> Option<([usize; D], [usize; D])> {
        let continuous: Vec<Point<D>> = coords
            .iter()
            .map(|p| self.geometry.continuous_index(p))
            .collect();

        let mut lo = [0; D];
        let mut hi = [0; D];
        for axis in 0..D {
            let (min, max) = continuous
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), c| {
                    (min.min(c[axis]), max.max(c[axis]))
                });
            let first = (min - FILL_TOL).ceil().max(0.0);
            let last = (max + FILL_TOL).floor().min((self.geometry.size[axis] - 1) as f64);
            if !(first <= last) {
                return None;
            }
            lo[axis] = first as usize;
            hi[axis] = last as usize;
        }
        Some((lo, hi))
    }

    /// Rebuilds every cell from the mesh's deformed configuration.
    ///
    /// Elements are visited in order and a cell keeps the first element
    /// whose geometry contains its centre.
    pub fn fill(&mut self, mesh: &Mesh<D>, show_progress: bool) -> Result<()> {
        self.cells.iter_mut().for_each(|c| *c = None);
        let bar = progress_bar(mesh.elements.len() as u64, show_progress);

        for (e, element) in mesh.elements.iter().enumerate() {
            bar.inc(1);
            let coords = mesh.element_coordinates(e, Configuration::Deformed)?;
            let (lo, hi) = match self.covered_cells(&coords) {
                Some(range) => range,
                None => continue,
            };

            let geometry = &self.geometry;
            let strides = &self.strides;
            let cells = &mut self.cells;
            for_each_in_box(lo, hi, |index| {
                let flat = flat_index(strides, index);
                if cells[flat].is_none() && element.contains_point(&coords, &geometry.point_at(index)) {
                    cells[flat] = Some(e);
                }
            });
        }
        bar.finish_and_clear();

        info!(
            "interpolation grid filled: {} of {} cells hold an element",
            self.occupied_cells(),
            self.cells.len()
        );
        Ok(())
    }

    /// Element containing `point` in the mesh's deformed configuration.
    ///
    /// The nearest cell's element is tried first, then the elements of the
    /// surrounding cells, each confirmed with an exact containment test.
    /// Points outside the grid, or whose neighbourhood holds no element
    /// containing them, give `None`. The grid spacing must be fine enough
    /// for every element to claim a cell.
    pub fn element_at(&self, mesh: &Mesh<D>, point: &Point<D>) -> Result<Option<usize>> {
        let index = match self.geometry.index_of(point) {
            Some(index) => index,
            None => return Ok(None),
        };

        let mut candidates: Vec<usize> = Vec::new();
        if let Some(e) = self.cells[flat_index(&self.strides, &index)] {
            candidates.push(e);
        }
        let lo: [usize; D] = std::array::from_fn(|i| index[i].saturating_sub(1));
        let hi: [usize; D] = std::array::from_fn(|i| (index[i] + 1).min(self.geometry.size[i] - 1));
        for_each_in_box(lo, hi, |neighbour| {
            if let Some(e) = self.cells[flat_index(&self.strides, neighbour)] {
                if !candidates.contains(&e) {
                    candidates.push(e);
                }
            }
        });

        for e in candidates {
            let coords = mesh.element_coordinates(e, Configuration::Deformed)?;
            if mesh.element(e)?.contains_point(&coords, point) {
                return Ok(Some(e));
            }
        }

        Ok(None)
    }
}
