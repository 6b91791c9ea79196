use crate::grid::{MaskGrid, ScalarGrid};
use crate::stats::MaskedStatistics;

use ndarray::Axis;
use rayon::prelude::*;
use thiserror::Error;

/// The dose volume contains negative values, which cannot be valid radiation
/// dose. Indicates an input or configuration error upstream.
#[derive(Debug, Clone, Copy, Error)]
#[error("the dose volume contains negative dose values (minimum {min_dose})")]
pub struct NegativeDoseError {
    pub min_dose: f64,
}

/// One point of a cumulative curve: the fraction of the structure volume (in
/// percent) receiving at least `dose`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DvhSample {
    pub dose: f64,
    pub volume_percent: f64,
}

/// A structure's cumulative dose-volume histogram.
///
/// Samples are stored in the order they were produced. Cumulative volume is
/// non-increasing along the sequence; the abscissa is increasing except for
/// the first sample of a curve whose binning started below zero, which is
/// normalized to 0.0 in place.
#[derive(Debug, Clone)]
pub struct DvhCurve {
    pub name: String,
    pub samples: Vec<DvhSample>,
}

impl DvhCurve {
    pub fn new(name: impl Into<String>, samples: Vec<DvhSample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Binning parameters for curve construction.
///
/// Dose volumes use a fixed abscissa lattice `start_value + k * step_size`;
/// generic intensity volumes span the masked value range in
/// `intensity_samples` points instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinningConfig {
    pub start_value: f64,
    pub step_size: f64,
    pub intensity_samples: usize,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            start_value: 0.1,
            step_size: 0.2,
            intensity_samples: 100,
        }
    }
}

/// Build the cumulative curve for one structure.
///
/// `max_dose` is the maximum of the whole dose grid (not just the masked
/// part), so every structure of a run is sampled on the same abscissa
/// lattice. For intensity volumes the masked range from `stats` is used
/// instead.
///
/// For each abscissa the number of masked voxels with a value strictly below
/// it is counted; the sample value is `(1 - below/total) * 100`. A curve
/// whose first abscissa is at or above zero is anchored with a leading
/// (0.0, 100%) point; one that starts below zero gets no anchor and its
/// first sample's abscissa is forced to 0.0 instead.
///
/// # Panics
///
/// Panics if dose and mask are not on the identical geometry.
pub fn build_curve(
    name: &str,
    dose: &ScalarGrid,
    mask: &MaskGrid,
    stats: &MaskedStatistics,
    is_dose_volume: bool,
    max_dose: f64,
    config: &BinningConfig,
) -> Result<DvhCurve, NegativeDoseError> {
    assert_eq!(
        dose.geometry, mask.geometry,
        "dose and mask must share one reconciled geometry"
    );

    let (start_value, step_size, num_samples) = if is_dose_volume {
        if stats.min_dose < 0.0 {
            return Err(NegativeDoseError {
                min_dose: stats.min_dose,
            });
        }
        let count = ((max_dose - config.start_value) / config.step_size).ceil() as i64 + 1;
        (config.start_value, config.step_size, count.max(1) as usize)
    } else {
        let count = config.intensity_samples.max(2);
        let step = (stats.max_dose - stats.min_dose) / (count - 1) as f64;
        (stats.min_dose, step, count)
    };

    let (below_start, bins) = count_bins(dose, mask, start_value, step_size, num_samples);

    let insert_point_at_origin = start_value >= 0.0;
    let mut samples = Vec::with_capacity(num_samples + usize::from(insert_point_at_origin));
    if insert_point_at_origin {
        samples.push(DvhSample {
            dose: 0.0,
            volume_percent: 100.0,
        });
    }

    let total = stats.voxel_count as f64;
    let mut below = below_start;
    for (index, &bin_count) in bins.iter().enumerate() {
        samples.push(DvhSample {
            dose: start_value + index as f64 * step_size,
            volume_percent: (1.0 - below as f64 / total) * 100.0,
        });
        below += bin_count;
    }

    // Normalization step for curves starting below zero: the opening sample
    // is moved to abscissa 0.0 in place rather than anchored.
    if !insert_point_at_origin {
        samples[0].dose = 0.0;
    }

    Ok(DvhCurve::new(name, samples))
}

/// Count, over the masked voxels, how many fall strictly below the first
/// abscissa and how many fall into each half-open bin
/// `[start + k*step, start + (k+1)*step)`.
fn count_bins(
    dose: &ScalarGrid,
    mask: &MaskGrid,
    start_value: f64,
    step_size: f64,
    num_samples: usize,
) -> (u64, Vec<u64>) {
    dose.data
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(mask.data.axis_iter(Axis(0)).into_par_iter())
        .map(|(dose_slab, mask_slab)| {
            let mut below = 0u64;
            let mut bins = vec![0u64; num_samples];
            for (&value, &inside) in dose_slab.iter().zip(mask_slab.iter()) {
                if !inside {
                    continue;
                }
                if value < start_value {
                    below += 1;
                } else if step_size > 0.0 {
                    let index = ((value - start_value) / step_size).floor() as usize;
                    if index < num_samples {
                        bins[index] += 1;
                    }
                }
                // Zero step (constant intensity volume): every voxel sits on
                // the single abscissa and is never strictly below it.
            }
            (below, bins)
        })
        .reduce(
            || (0u64, vec![0u64; num_samples]),
            |(below_a, mut bins_a), (below_b, bins_b)| {
                for (a, b) in bins_a.iter_mut().zip(bins_b) {
                    *a += b;
                }
                (below_a + below_b, bins_a)
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Geometry;
    use crate::stats::compute_statistics;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn unit_geometry(dim: (usize, usize, usize)) -> Geometry {
        Geometry::new(dim, (1.0, 1.0, 1.0), (0.0, 0.0, 0.0))
    }

    fn uniform_case(value: f64) -> (ScalarGrid, MaskGrid, MaskedStatistics) {
        let dim = (10, 10, 10);
        let dose = ScalarGrid::new(Array3::from_elem(dim, value), unit_geometry(dim));
        let mut mask_data = Array3::from_elem(dim, false);
        mask_data.slice_mut(ndarray::s![..5, .., ..]).fill(true);
        let mask = MaskGrid::new(mask_data, unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        (dose, mask, stats)
    }

    #[test]
    fn uniform_dose_is_a_step_function() {
        let (dose, mask, stats) = uniform_case(5.0);
        let curve = build_curve(
            "target",
            &dose,
            &mask,
            &stats,
            true,
            dose.max_value(),
            &BinningConfig::default(),
        )
        .unwrap();

        // Anchor plus ceil((5.0 - 0.1) / 0.2) + 1 = 26 sampled bins.
        assert_eq!(curve.len(), 27);
        assert_relative_eq!(curve.samples[0].dose, 0.0);
        assert_relative_eq!(curve.samples[0].volume_percent, 100.0);

        for sample in &curve.samples {
            if sample.dose <= 5.0 {
                assert_relative_eq!(sample.volume_percent, 100.0);
            } else {
                assert_relative_eq!(sample.volume_percent, 0.0);
            }
        }
        let last = curve.samples.last().unwrap();
        assert_relative_eq!(last.dose, 5.1, epsilon = 1e-12);
        assert_relative_eq!(last.volume_percent, 0.0);
    }

    #[test]
    fn cumulative_volume_is_monotone_non_increasing() {
        let dim = (8, 8, 8);
        let data = Array3::from_shape_fn(dim, |(k, j, i)| (k + j + i) as f64 * 0.37);
        let dose = ScalarGrid::new(data, unit_geometry(dim));
        let mask = MaskGrid::new(Array3::from_elem(dim, true), unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        let curve = build_curve(
            "body",
            &dose,
            &mask,
            &stats,
            true,
            dose.max_value(),
            &BinningConfig::default(),
        )
        .unwrap();

        for pair in curve.samples.windows(2) {
            assert!(pair[0].volume_percent >= pair[1].volume_percent);
        }
    }

    #[test]
    fn negative_dose_fails_for_dose_volumes() {
        let dim = (2, 2, 2);
        let mut data = Array3::from_elem(dim, 1.0);
        data[[0, 0, 0]] = -0.5;
        let dose = ScalarGrid::new(data, unit_geometry(dim));
        let mask = MaskGrid::new(Array3::from_elem(dim, true), unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        let result = build_curve(
            "bad",
            &dose,
            &mask,
            &stats,
            true,
            dose.max_value(),
            &BinningConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn intensity_volume_spans_masked_range_and_forces_origin() {
        let dim = (1, 1, 100);
        let data = Array3::from_shape_fn(dim, |(_, _, i)| -20.0 + i as f64 * (100.0 / 99.0));
        let dose = ScalarGrid::new(data, unit_geometry(dim));
        let mask = MaskGrid::new(Array3::from_elem(dim, true), unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        assert_relative_eq!(stats.min_dose, -20.0);
        assert_relative_eq!(stats.max_dose, 80.0, epsilon = 1e-9);

        let curve = build_curve(
            "ct",
            &dose,
            &mask,
            &stats,
            false,
            dose.max_value(),
            &BinningConfig::default(),
        )
        .unwrap();

        // No anchor; 100 samples; the first abscissa is normalized to 0.0
        // while the rest keep the uniform lattice.
        assert_eq!(curve.len(), 100);
        assert_relative_eq!(curve.samples[0].dose, 0.0);
        assert_relative_eq!(curve.samples[0].volume_percent, 100.0);
        let step = (80.0 - (-20.0)) / 99.0;
        assert_relative_eq!(curve.samples[1].dose, -20.0 + step, epsilon = 1e-9);
        assert_relative_eq!(curve.samples[99].dose, 80.0, epsilon = 1e-9);
    }

    #[test]
    fn intensity_volume_with_positive_range_is_anchored() {
        let dim = (1, 1, 10);
        let data = Array3::from_shape_fn(dim, |(_, _, i)| 10.0 + i as f64);
        let dose = ScalarGrid::new(data, unit_geometry(dim));
        let mask = MaskGrid::new(Array3::from_elem(dim, true), unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        let curve = build_curve(
            "pet",
            &dose,
            &mask,
            &stats,
            false,
            dose.max_value(),
            &BinningConfig::default(),
        )
        .unwrap();

        assert_eq!(curve.len(), 101);
        assert_relative_eq!(curve.samples[0].dose, 0.0);
        assert_relative_eq!(curve.samples[0].volume_percent, 100.0);
        assert_relative_eq!(curve.samples[1].dose, 10.0);
    }

    #[test]
    fn constant_intensity_volume_degenerates_safely() {
        let dim = (2, 2, 2);
        let dose = ScalarGrid::new(Array3::from_elem(dim, 3.0), unit_geometry(dim));
        let mask = MaskGrid::new(Array3::from_elem(dim, true), unit_geometry(dim));
        let stats = compute_statistics(&dose, &mask).unwrap();
        let curve = build_curve(
            "flat",
            &dose,
            &mask,
            &stats,
            false,
            dose.max_value(),
            &BinningConfig::default(),
        )
        .unwrap();

        for sample in &curve.samples[1..] {
            assert_relative_eq!(sample.dose, 3.0);
            assert_relative_eq!(sample.volume_percent, 100.0);
        }
    }
}
