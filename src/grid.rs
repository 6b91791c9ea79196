use ndarray::Array3;

/// Placement of a regular 3D grid in physical space.
///
/// Dimensions are ordered `(depth, height, width)` corresponding to `(z, y, x)`
/// array indexing; `spacing` and `origin` are ordered `(x, y, z)` in
/// millimeters. `origin` is the physical position of the center of voxel
/// `(0, 0, 0)`. Axes are assumed axis-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub dim: (usize, usize, usize),
    pub spacing: (f64, f64, f64),
    pub origin: (f64, f64, f64),
}

impl Geometry {
    /// # Panics
    ///
    /// Panics if any spacing component is not strictly positive.
    pub fn new(
        dim: (usize, usize, usize),
        spacing: (f64, f64, f64),
        origin: (f64, f64, f64),
    ) -> Self {
        assert!(
            spacing.0 > 0.0 && spacing.1 > 0.0 && spacing.2 > 0.0,
            "grid spacing components must be strictly positive, got {spacing:?}"
        );
        Self { dim, spacing, origin }
    }

    /// Volume of a single voxel in cubic millimeters.
    pub fn voxel_volume_mm3(&self) -> f64 {
        self.spacing.0 * self.spacing.1 * self.spacing.2
    }

    /// Physical position `(x, y, z)` of the center of voxel `(k, j, i)`.
    #[inline]
    pub fn index_to_world(&self, k: usize, j: usize, i: usize) -> (f64, f64, f64) {
        (
            self.origin.0 + i as f64 * self.spacing.0,
            self.origin.1 + j as f64 * self.spacing.1,
            self.origin.2 + k as f64 * self.spacing.2,
        )
    }

    /// Continuous voxel index `(z, y, x)` of a physical position.
    #[inline]
    pub fn world_to_index(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        (
            (z - self.origin.2) / self.spacing.2,
            (y - self.origin.1) / self.spacing.1,
            (x - self.origin.0) / self.spacing.0,
        )
    }

    pub fn voxel_count(&self) -> usize {
        self.dim.0 * self.dim.1 * self.dim.2
    }
}

/// A 3D array of floating-point samples with a physical placement.
///
/// Treated as an immutable view for the duration of a single computation;
/// resampling produces a new grid rather than mutating in place.
#[derive(Debug, Clone)]
pub struct ScalarGrid {
    pub data: Array3<f64>,
    pub geometry: Geometry,
}

impl ScalarGrid {
    /// # Panics
    ///
    /// Panics if the array shape does not match the geometry dimensions.
    pub fn new(data: Array3<f64>, geometry: Geometry) -> Self {
        assert_eq!(
            data.dim(),
            geometry.dim,
            "scalar grid data shape must match its geometry"
        );
        Self { data, geometry }
    }

    /// Maximum sample value over the whole grid, ignoring the mask.
    pub fn max_value(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// A boolean occupancy grid selecting the voxels belonging to a structure.
#[derive(Debug, Clone)]
pub struct MaskGrid {
    pub data: Array3<bool>,
    pub geometry: Geometry,
}

impl MaskGrid {
    /// # Panics
    ///
    /// Panics if the array shape does not match the geometry dimensions.
    pub fn new(data: Array3<bool>, geometry: Geometry) -> Self {
        assert_eq!(
            data.dim(),
            geometry.dim,
            "mask grid data shape must match its geometry"
        );
        Self { data, geometry }
    }

    /// Threshold a scalar occupancy grid into a binary mask. Voxels at or
    /// above 0.5 are considered inside the structure.
    pub fn from_scalar(grid: &ScalarGrid) -> Self {
        Self {
            data: grid.data.mapv(|v| v >= 0.5),
            geometry: grid.geometry.clone(),
        }
    }
}
