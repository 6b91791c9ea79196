use crate::grid::{MaskGrid, ScalarGrid};

use ndarray::Axis;
use rayon::prelude::*;
use thiserror::Error;

/// The structure mask selects no voxels of the dose grid. Expected for
/// structures lying entirely outside the dose field; reported per structure,
/// never fatal for a batch.
#[derive(Debug, Clone, Copy, Error)]
#[error("dose volume and the structure do not overlap")]
pub struct VoxelOverlapError;

/// Per-structure summary of the dose restricted to the mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskedStatistics {
    pub voxel_count: u64,
    pub min_dose: f64,
    pub max_dose: f64,
    pub mean_dose: f64,
    pub total_volume_cc: f64,
}

#[derive(Clone, Copy)]
struct Accumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            count: self.count + other.count,
            sum: self.sum + other.sum,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Compute voxel count, min, max and mean of the dose restricted to the mask
/// in one parallel pass, plus the structure volume in cubic centimeters.
///
/// Negative dose values are accepted here; the histogram binning policy
/// decides how to treat them.
///
/// # Panics
///
/// Panics if dose and mask are not on the identical geometry. Callers obtain
/// both from the geometry reconciler, so a mismatch is a programming error.
pub fn compute_statistics(
    dose: &ScalarGrid,
    mask: &MaskGrid,
) -> Result<MaskedStatistics, VoxelOverlapError> {
    assert_eq!(
        dose.geometry, mask.geometry,
        "dose and mask must share one reconciled geometry"
    );

    let acc = dose
        .data
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(mask.data.axis_iter(Axis(0)).into_par_iter())
        .map(|(dose_slab, mask_slab)| {
            let mut acc = Accumulator::new();
            for (&value, &inside) in dose_slab.iter().zip(mask_slab.iter()) {
                if inside {
                    acc.count += 1;
                    acc.sum += value;
                    acc.min = acc.min.min(value);
                    acc.max = acc.max.max(value);
                }
            }
            acc
        })
        .reduce(Accumulator::new, Accumulator::merge);

    if acc.count == 0 {
        return Err(VoxelOverlapError);
    }

    let cc_per_cubic_mm = 1e-3;
    Ok(MaskedStatistics {
        voxel_count: acc.count,
        min_dose: acc.min,
        max_dose: acc.max,
        mean_dose: acc.sum / acc.count as f64,
        total_volume_cc: acc.count as f64 * dose.geometry.voxel_volume_mm3() * cc_per_cubic_mm,
    })
}
