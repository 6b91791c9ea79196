use crate::grid::{Geometry, MaskGrid, ScalarGrid};

use ndarray::{Array3, ArrayView3, Zip};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GeometryError {
    #[error("structure mask has an empty extent {dim:?}")]
    EmptyMask { dim: (usize, usize, usize) },

    #[error("oversampling factor must be positive and finite, got {0}")]
    InvalidFactor(f64),

    #[error("regenerated mask geometry does not match the requested geometry")]
    MismatchedRasterization,
}

/// Provider of a structure's binary mask.
///
/// `rasterize_at` lets sources that keep a resolution-independent native
/// representation (e.g. a closed surface) produce the mask directly on the
/// requested geometry, skipping a resampling pass. Sources that only hold a
/// rasterized mask rely on the nearest-neighbor fallback.
pub trait MaskSource {
    /// The mask at the source's native resolution.
    fn native_mask(&self) -> &MaskGrid;

    /// Regenerate the mask directly on `target`, if the native
    /// representation supports it.
    fn rasterize_at(&self, target: &Geometry) -> Option<MaskGrid> {
        let _ = target;
        None
    }
}

impl MaskSource for MaskGrid {
    fn native_mask(&self) -> &MaskGrid {
        self
    }
}

/// A dose grid and a structure mask on one shared geometry, ready for the
/// statistics pass.
#[derive(Debug, Clone)]
pub struct ReconciledPair {
    pub dose: ScalarGrid,
    pub mask: MaskGrid,
    pub oversampling_factor: f64,
}

pub struct Resampler;

impl Resampler {
    /// Derive the oversampled geometry: spacing divided by `factor`, voxel
    /// counts scaled up to keep the covered physical extent, origin shifted
    /// so the new voxel centers tile the same bounds.
    pub fn oversampled_geometry(base: &Geometry, factor: f64) -> Result<Geometry, GeometryError> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(GeometryError::InvalidFactor(factor));
        }
        let scale = |n: usize| ((n as f64 * factor).round() as usize).max(1);
        let dim = (scale(base.dim.0), scale(base.dim.1), scale(base.dim.2));
        let spacing = (
            base.spacing.0 / factor,
            base.spacing.1 / factor,
            base.spacing.2 / factor,
        );
        let origin = (
            base.origin.0 - base.spacing.0 / 2.0 + spacing.0 / 2.0,
            base.origin.1 - base.spacing.1 / 2.0 + spacing.1 / 2.0,
            base.origin.2 - base.spacing.2 / 2.0 + spacing.2 / 2.0,
        );
        Ok(Geometry::new(dim, spacing, origin))
    }

    /// Per-structure automatic oversampling factor: cube root of the voxel
    /// volume ratio between the dose grid and the native mask, rounded to
    /// two decimals. Rounding is needed because e.g. `64f64.powf(1.0/3.0)`
    /// is not exactly 4.
    pub fn automatic_oversampling_factor(dose: &Geometry, native_mask: &Geometry) -> f64 {
        let ratio = dose.voxel_volume_mm3() / native_mask.voxel_volume_mm3();
        (ratio.powf(1.0 / 3.0) * 100.0).round() / 100.0
    }

    /// Resample a scalar grid onto `target` with trilinear interpolation.
    /// Sample positions outside the source extent clamp to the border.
    pub fn resample_trilinear(src: &ScalarGrid, target: &Geometry) -> ScalarGrid {
        let (nz, ny, nx) = src.geometry.dim;
        let max_z = (nz - 1) as f64;
        let max_y = (ny - 1) as f64;
        let max_x = (nx - 1) as f64;
        let src_geometry = src.geometry.clone();
        let view = src.data.view();

        let mut data = Array3::zeros(target.dim);
        Zip::indexed(&mut data).par_for_each(|(k, j, i), value| {
            let (x, y, z) = target.index_to_world(k, j, i);
            let (fz, fy, fx) = src_geometry.world_to_index(x, y, z);
            *value = Self::trilinear_interpolate(
                &view,
                fz.clamp(0.0, max_z),
                fy.clamp(0.0, max_y),
                fx.clamp(0.0, max_x),
            );
        });
        ScalarGrid::new(data, target.clone())
    }

    /// Resample a binary mask onto `target` by nearest neighbor. Positions
    /// outside the source extent become unmasked, so a mask resampled onto
    /// a dose geometry always covers the full dose extent.
    pub fn resample_mask_nearest(src: &MaskGrid, target: &Geometry) -> MaskGrid {
        let (nz, ny, nx) = src.geometry.dim;
        let src_geometry = src.geometry.clone();
        let view = src.data.view();

        let mut data = Array3::from_elem(target.dim, false);
        Zip::indexed(&mut data).par_for_each(|(k, j, i), value| {
            let (x, y, z) = target.index_to_world(k, j, i);
            let (fz, fy, fx) = src_geometry.world_to_index(x, y, z);
            let rz = fz.round();
            let ry = fy.round();
            let rx = fx.round();
            *value = rz >= 0.0
                && ry >= 0.0
                && rx >= 0.0
                && (rz as usize) < nz
                && (ry as usize) < ny
                && (rx as usize) < nx
                && view[[rz as usize, ry as usize, rx as usize]];
        });
        MaskGrid::new(data, target.clone())
    }

    /// Produce a structure's mask on `target`, preferring regeneration from
    /// the native representation over resampling.
    pub fn mask_on_geometry(
        source: &dyn MaskSource,
        target: &Geometry,
    ) -> Result<MaskGrid, GeometryError> {
        let native = source.native_mask();
        let dim = native.geometry.dim;
        if dim.0 == 0 || dim.1 == 0 || dim.2 == 0 {
            return Err(GeometryError::EmptyMask { dim });
        }
        match source.rasterize_at(target) {
            Some(mask) => {
                if mask.geometry != *target {
                    return Err(GeometryError::MismatchedRasterization);
                }
                Ok(mask)
            }
            None => Ok(Self::resample_mask_nearest(native, target)),
        }
    }

    /// Reconcile one structure in automatic mode: oversample the dose
    /// geometry for this structure's own factor, bring the mask onto it,
    /// and resample the dose to match.
    pub fn reconcile_automatic(
        dose: &ScalarGrid,
        source: &dyn MaskSource,
    ) -> Result<ReconciledPair, GeometryError> {
        let factor =
            Self::automatic_oversampling_factor(&dose.geometry, &source.native_mask().geometry);
        let target = Self::oversampled_geometry(&dose.geometry, factor)?;
        let mask = Self::mask_on_geometry(source, &target)?;
        let dose = Self::resample_trilinear(dose, &target);
        Ok(ReconciledPair {
            dose,
            mask,
            oversampling_factor: factor,
        })
    }

    #[inline]
    fn trilinear_interpolate(data: &ArrayView3<f64>, z: f64, y: f64, x: f64) -> f64 {
        let (nz, ny, nx) = data.dim();

        let z0 = z.floor() as usize;
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let z1 = (z0 + 1).min(nz - 1);
        let y1 = (y0 + 1).min(ny - 1);
        let x1 = (x0 + 1).min(nx - 1);

        let dz = z - z0 as f64;
        let dy = y - y0 as f64;
        let dx = x - x0 as f64;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = data[[z0, y0, x0]].mul_add(one_minus_dx, data[[z0, y0, x1]] * dx);
        let v01 = data[[z0, y1, x0]].mul_add(one_minus_dx, data[[z0, y1, x1]] * dx);
        let v10 = data[[z1, y0, x0]].mul_add(one_minus_dx, data[[z1, y0, x1]] * dx);
        let v11 = data[[z1, y1, x0]].mul_add(one_minus_dx, data[[z1, y1, x1]] * dx);

        let v0 = v00.mul_add(one_minus_dy, v01 * dy);
        let v1 = v10.mul_add(one_minus_dy, v11 * dy);

        v0.mul_add(1.0 - dz, v1 * dz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn uniform_grid(dim: (usize, usize, usize), spacing: f64, value: f64) -> ScalarGrid {
        let geometry = Geometry::new(dim, (spacing, spacing, spacing), (0.0, 0.0, 0.0));
        ScalarGrid::new(Array3::from_elem(dim, value), geometry)
    }

    #[test]
    fn oversampled_geometry_preserves_extent() {
        let base = Geometry::new((10, 20, 30), (2.0, 2.0, 4.0), (1.0, 1.0, 1.0));
        let fine = Resampler::oversampled_geometry(&base, 2.0).unwrap();
        assert_eq!(fine.dim, (20, 40, 60));
        assert_relative_eq!(fine.spacing.0, 1.0);
        assert_relative_eq!(fine.spacing.2, 2.0);
        // Physical bounds of the voxel lattice are unchanged.
        assert_relative_eq!(fine.origin.0 - fine.spacing.0 / 2.0, base.origin.0 - 1.0);
        let base_end = base.origin.2 + (base.dim.0 as f64 - 0.5) * base.spacing.2;
        let fine_end = fine.origin.2 + (fine.dim.0 as f64 - 0.5) * fine.spacing.2;
        assert_relative_eq!(base_end, fine_end);
    }

    #[test]
    fn invalid_factor_is_rejected() {
        let base = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        assert!(Resampler::oversampled_geometry(&base, 0.0).is_err());
        assert!(Resampler::oversampled_geometry(&base, f64::NAN).is_err());
    }

    #[test]
    fn automatic_factor_rounds_to_two_decimals() {
        let dose = Geometry::new((2, 2, 2), (4.0, 4.0, 4.0), (0.0, 0.0, 0.0));
        let native = Geometry::new((8, 8, 8), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        // 64^(1/3) is not exactly 4 in floating point; the rounding rule
        // must recover it.
        assert_relative_eq!(Resampler::automatic_oversampling_factor(&dose, &native), 4.0);

        let slightly_off = Geometry::new((8, 8, 8), (0.97, 1.0, 1.0), (0.0, 0.0, 0.0));
        let factor = Resampler::automatic_oversampling_factor(&dose, &slightly_off);
        assert_relative_eq!(factor, (factor * 100.0).round() / 100.0);
    }

    #[test]
    fn trilinear_resample_of_uniform_grid_is_uniform() {
        let src = uniform_grid((4, 4, 4), 2.0, 7.5);
        let target = Resampler::oversampled_geometry(&src.geometry, 2.0).unwrap();
        let out = Resampler::resample_trilinear(&src, &target);
        assert_eq!(out.geometry.dim, (8, 8, 8));
        for &v in out.data.iter() {
            assert_relative_eq!(v, 7.5);
        }
    }

    #[test]
    fn trilinear_resample_interpolates_gradient() {
        let geometry = Geometry::new((1, 1, 3), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        let src = ScalarGrid::new(
            Array3::from_shape_vec((1, 1, 3), vec![0.0, 1.0, 2.0]).unwrap(),
            geometry,
        );
        let target = Geometry::new((1, 1, 5), (0.5, 1.0, 1.0), (0.25, 0.0, 0.0));
        let out = Resampler::resample_trilinear(&src, &target);
        let values: Vec<f64> = out.data.iter().copied().collect();
        assert_relative_eq!(values[0], 0.25);
        assert_relative_eq!(values[1], 0.75);
        assert_relative_eq!(values[2], 1.25);
    }

    #[test]
    fn mask_resample_pads_outside_with_unmasked() {
        let geometry = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        let mask = MaskGrid::new(Array3::from_elem((2, 2, 2), true), geometry);
        // Larger target extent than the mask covers.
        let target = Geometry::new((4, 4, 4), (1.0, 1.0, 1.0), (-1.0, -1.0, -1.0));
        let out = Resampler::resample_mask_nearest(&mask, &target);
        let inside = out.data.iter().filter(|&&m| m).count();
        assert_eq!(inside, 8);
        assert!(!out.data[[0, 0, 0]]);
        assert!(out.data[[1, 1, 1]]);
    }

    #[test]
    fn empty_native_mask_is_a_geometry_error() {
        let geometry = Geometry::new((0, 4, 4), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        let mask = MaskGrid {
            data: Array3::from_elem((0, 4, 4), false),
            geometry,
        };
        let target = Geometry::new((4, 4, 4), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        assert!(matches!(
            Resampler::mask_on_geometry(&mask, &target),
            Err(GeometryError::EmptyMask { .. })
        ));
    }

    struct Rasterizable {
        native: MaskGrid,
    }

    impl MaskSource for Rasterizable {
        fn native_mask(&self) -> &MaskGrid {
            &self.native
        }

        fn rasterize_at(&self, target: &Geometry) -> Option<MaskGrid> {
            Some(MaskGrid::new(Array3::from_elem(target.dim, true), target.clone()))
        }
    }

    #[test]
    fn regeneration_is_preferred_over_resampling() {
        let geometry = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        let source = Rasterizable {
            native: MaskGrid::new(Array3::from_elem((2, 2, 2), false), geometry),
        };
        let target = Geometry::new((3, 3, 3), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0));
        let mask = Resampler::mask_on_geometry(&source, &target).unwrap();
        // The all-false native mask would have produced an empty resampled
        // mask; regeneration returned all-true instead.
        assert!(mask.data.iter().all(|&m| m));
    }
}
