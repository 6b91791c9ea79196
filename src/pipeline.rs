use crate::enums::OversamplingPolicy;
use crate::grid::ScalarGrid;
use crate::histogram::{BinningConfig, DvhCurve, NegativeDoseError, build_curve};
use crate::metrics::{MetricSpec, MetricsTable, StructureRecord, recompute_metrics_table};
use crate::resample::{GeometryError, MaskSource, Resampler};
use crate::stats::{MaskedStatistics, VoxelOverlapError, compute_statistics};

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Why one structure's DVH computation failed. Collected per structure; a
/// batch never fails as a whole because of one bad structure.
#[derive(Debug, Clone, Error)]
pub enum DvhError {
    #[error("geometry reconciliation failed: {0}")]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Overlap(#[from] VoxelOverlapError),

    #[error(transparent)]
    NegativeDose(#[from] NegativeDoseError),
}

/// A volumetric region to compute a DVH for.
///
/// `segmentation` is an opaque reference to the owning segmentation; the
/// computation never inspects it.
pub struct Structure {
    pub id: String,
    pub name: String,
    pub segmentation: Option<String>,
    pub source: Box<dyn MaskSource + Send + Sync>,
}

impl Structure {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: impl MaskSource + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            segmentation: None,
            source: Box::new(source),
        }
    }
}

/// Parameters shared by every structure of a run.
#[derive(Debug, Clone)]
pub struct DvhParameters {
    pub oversampling: OversamplingPolicy,
    pub binning: BinningConfig,
    /// Whether the input grid represents radiation dose (as opposed to a
    /// generic intensity volume such as CT).
    pub is_dose_volume: bool,
    /// Display unit for dose values; `None` for intensity volumes.
    pub dose_unit: Option<String>,
    /// Display name of the input volume, carried into the metrics table.
    pub dose_volume_name: String,
}

impl Default for DvhParameters {
    fn default() -> Self {
        Self {
            oversampling: OversamplingPolicy::default(),
            binning: BinningConfig::default(),
            is_dose_volume: true,
            dose_unit: Some("Gy".to_string()),
            dose_volume_name: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructureResult {
    pub id: String,
    pub name: String,
    pub curve: DvhCurve,
    pub stats: MaskedStatistics,
    /// The factor actually used; recorded for reporting under the automatic
    /// policy.
    pub oversampling_factor: f64,
}

#[derive(Debug, Clone)]
pub struct StructureFailure {
    pub id: String,
    pub name: String,
    pub error: DvhError,
}

/// All per-structure outcomes of one batch, tagged with the generation it
/// was started under.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub generation: u64,
    pub results: Vec<StructureResult>,
    pub failures: Vec<StructureFailure>,
}

/// Progress is reported at structure granularity as a fraction in (0, 1].
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Sync);

enum PreparedDose<'a> {
    /// One oversampled dose grid shared by all structures.
    Fixed { dose: ScalarGrid, factor: f64 },
    /// Each structure reconciles against the raw dose grid on its own.
    Automatic { dose: &'a ScalarGrid },
}

/// Compute DVHs for every structure, one independent unit of work per
/// structure, in parallel. Per-structure failures are collected alongside
/// successes; only an invalid fixed oversampling configuration fails the
/// batch as a whole.
pub fn compute_batch(
    dose: &ScalarGrid,
    structures: &[Structure],
    params: &DvhParameters,
    generation: u64,
    progress: Option<ProgressFn<'_>>,
) -> Result<BatchOutcome, GeometryError> {
    // Maximum over the whole dose grid, taken before any resampling, so all
    // structures share one abscissa lattice.
    let max_dose = dose.max_value();

    let prepared = match params.oversampling {
        OversamplingPolicy::Fixed(factor) => {
            let target = Resampler::oversampled_geometry(&dose.geometry, factor)?;
            PreparedDose::Fixed {
                dose: Resampler::resample_trilinear(dose, &target),
                factor,
            }
        }
        OversamplingPolicy::Automatic => PreparedDose::Automatic { dose },
    };

    let completed = AtomicUsize::new(0);
    let total = structures.len().max(1);
    let outcomes: Vec<Result<StructureResult, StructureFailure>> = structures
        .par_iter()
        .map(|structure| {
            let outcome = compute_one(&prepared, structure, params, max_dose);
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(report) = progress {
                report(done as f64 / total as f64);
            }
            outcome.map_err(|error| {
                log::warn!("DVH computation failed for structure '{}': {error}", structure.name);
                StructureFailure {
                    id: structure.id.clone(),
                    name: structure.name.clone(),
                    error,
                }
            })
        })
        .collect();

    let mut results = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(failure) => failures.push(failure),
        }
    }
    Ok(BatchOutcome {
        generation,
        results,
        failures,
    })
}

/// Compute a single structure's curve outside of any batch.
pub fn compute_dvh_for_structure(
    dose: &ScalarGrid,
    structure: &Structure,
    params: &DvhParameters,
) -> Result<StructureResult, DvhError> {
    let max_dose = dose.max_value();
    let prepared = match params.oversampling {
        OversamplingPolicy::Fixed(factor) => {
            let target = Resampler::oversampled_geometry(&dose.geometry, factor)?;
            PreparedDose::Fixed {
                dose: Resampler::resample_trilinear(dose, &target),
                factor,
            }
        }
        OversamplingPolicy::Automatic => PreparedDose::Automatic { dose },
    };
    compute_one(&prepared, structure, params, max_dose)
}

fn compute_one(
    prepared: &PreparedDose<'_>,
    structure: &Structure,
    params: &DvhParameters,
    max_dose: f64,
) -> Result<StructureResult, DvhError> {
    let started = Instant::now();
    let source = structure.source.as_ref();

    let (stats, curve, factor) = match prepared {
        PreparedDose::Fixed { dose, factor } => {
            let mask = Resampler::mask_on_geometry(source, &dose.geometry)?;
            let stats = compute_statistics(dose, &mask)?;
            let curve = build_curve(
                &structure.name,
                dose,
                &mask,
                &stats,
                params.is_dose_volume,
                max_dose,
                &params.binning,
            )?;
            (stats, curve, *factor)
        }
        PreparedDose::Automatic { dose } => {
            let pair = Resampler::reconcile_automatic(*dose, source)?;
            let stats = compute_statistics(&pair.dose, &pair.mask)?;
            let curve = build_curve(
                &structure.name,
                &pair.dose,
                &pair.mask,
                &stats,
                params.is_dose_volume,
                max_dose,
                &params.binning,
            )?;
            (stats, curve, pair.oversampling_factor)
        }
    };

    log::debug!(
        "DVH computation time for structure '{}': {:.3?}",
        structure.id,
        started.elapsed()
    );

    Ok(StructureResult {
        id: structure.id.clone(),
        name: structure.name.clone(),
        curve,
        stats,
        oversampling_factor: factor,
    })
}

/// Holds the published curves and metrics table across recomputations.
///
/// Recomputations are keyed by a generation counter: a new batch supersedes
/// an in-flight one simply by bumping the generation, and any outcome tagged
/// with a stale generation is dropped at publish time instead of being
/// written into the table.
#[derive(Default)]
pub struct Session {
    params: DvhParameters,
    spec: MetricSpec,
    generation: u64,
    results: Vec<StructureResult>,
    failures: Vec<StructureFailure>,
    visibility: HashMap<String, bool>,
    table: MetricsTable,
}

impl Session {
    pub fn new(params: DvhParameters) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Start a new batch, invalidating any still-running older one.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Run a full batch at a fresh generation and publish it.
    pub fn recompute(
        &mut self,
        dose: &ScalarGrid,
        structures: &[Structure],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), GeometryError> {
        let generation = self.next_generation();
        let outcome = compute_batch(dose, structures, &self.params, generation, progress)?;
        self.publish(outcome);
        Ok(())
    }

    /// Install a batch outcome and rebuild the metrics table. Returns false
    /// if the outcome was stale and dropped.
    pub fn publish(&mut self, outcome: BatchOutcome) -> bool {
        if outcome.generation != self.generation {
            log::debug!(
                "dropping stale batch result (generation {} < {})",
                outcome.generation,
                self.generation
            );
            return false;
        }
        self.results = outcome.results;
        self.failures = outcome.failures;
        self.rebuild_table();
        true
    }

    /// Replace the dynamic metric column set and repopulate every row.
    pub fn set_metric_spec(&mut self, spec: MetricSpec) {
        self.spec = spec;
        self.rebuild_table();
    }

    fn rebuild_table(&mut self) {
        let records: Vec<StructureRecord<'_>> = self
            .results
            .iter()
            .map(|result| StructureRecord {
                id: &result.id,
                name: &result.name,
                curve: &result.curve,
                total_volume_cc: result.stats.total_volume_cc,
                stats: Some(&result.stats),
                visible: *self.visibility.get(&result.id).unwrap_or(&true),
            })
            .collect();
        self.table = recompute_metrics_table(
            &records,
            &self.spec,
            self.params.dose_unit.as_deref(),
            &self.params.dose_volume_name,
        );
    }

    pub fn table(&self) -> &MetricsTable {
        &self.table
    }

    pub fn results(&self) -> &[StructureResult] {
        &self.results
    }

    pub fn failures(&self) -> &[StructureFailure] {
        &self.failures
    }

    pub fn is_visible(&self, structure_id: &str) -> Option<bool> {
        self.table.is_visible(structure_id)
    }

    pub fn set_visible(&mut self, structure_id: &str, visible: bool) -> bool {
        self.visibility.insert(structure_id.to_string(), visible);
        self.table.set_visible(structure_id, visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Geometry, MaskGrid};
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn unit_geometry(dim: (usize, usize, usize)) -> Geometry {
        Geometry::new(dim, (1.0, 1.0, 1.0), (0.0, 0.0, 0.0))
    }

    fn dose_grid() -> ScalarGrid {
        let dim = (10, 10, 10);
        ScalarGrid::new(Array3::from_elem(dim, 5.0), unit_geometry(dim))
    }

    fn inside_structure() -> Structure {
        let dim = (10, 10, 10);
        let mut data = Array3::from_elem(dim, false);
        data.slice_mut(ndarray::s![..5, .., ..]).fill(true);
        Structure::new("s1", "target", MaskGrid::new(data, unit_geometry(dim)))
    }

    fn outside_structure() -> Structure {
        let dim = (4, 4, 4);
        let geometry = Geometry::new(dim, (1.0, 1.0, 1.0), (500.0, 500.0, 500.0));
        Structure::new(
            "s2",
            "far away",
            MaskGrid::new(Array3::from_elem(dim, true), geometry),
        )
    }

    #[test]
    fn batch_collects_failures_without_aborting() {
        let dose = dose_grid();
        let structures = vec![inside_structure(), outside_structure()];
        let outcome = compute_batch(&dose, &structures, &DvhParameters::default(), 1, None).unwrap();

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].id, "s2");
        assert!(matches!(outcome.failures[0].error, DvhError::Overlap(_)));

        let result = &outcome.results[0];
        assert_relative_eq!(result.stats.total_volume_cc, 0.5, epsilon = 1e-9);
        assert_relative_eq!(result.oversampling_factor, 2.0);
    }

    #[test]
    fn fixed_oversampling_preserves_structure_volume() {
        let dose = dose_grid();
        let structures = vec![inside_structure()];
        let outcome = compute_batch(&dose, &structures, &DvhParameters::default(), 1, None).unwrap();
        let stats = &outcome.results[0].stats;
        // 8x the voxels at 1/8 the voxel volume.
        assert_eq!(stats.voxel_count, 4000);
        assert_relative_eq!(stats.total_volume_cc, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn automatic_mode_records_per_structure_factors() {
        let dose = dose_grid();
        let params = DvhParameters {
            oversampling: OversamplingPolicy::Automatic,
            ..DvhParameters::default()
        };

        // Native mask at 0.5mm spacing over the same extent: the dose voxel
        // volume ratio is 8, so the factor is 2.
        let dim = (20, 20, 20);
        let geometry = Geometry::new(dim, (0.5, 0.5, 0.5), (-0.25, -0.25, -0.25));
        let mut data = Array3::from_elem(dim, false);
        data.slice_mut(ndarray::s![..10, .., ..]).fill(true);
        let structures = vec![Structure::new(
            "s1",
            "fine",
            MaskGrid::new(data, geometry),
        )];

        let outcome = compute_batch(&dose, &structures, &params, 1, None).unwrap();
        assert_relative_eq!(outcome.results[0].oversampling_factor, 2.0);
        assert_relative_eq!(outcome.results[0].stats.total_volume_cc, 0.5, epsilon = 0.05);
    }

    #[test]
    fn progress_reaches_one() {
        let dose = dose_grid();
        let structures = vec![inside_structure(), outside_structure()];
        let calls = AtomicUsize::new(0);
        let max_seen = std::sync::Mutex::new(0.0f64);
        let progress = |fraction: f64| {
            calls.fetch_add(1, Ordering::Relaxed);
            let mut max = max_seen.lock().unwrap();
            *max = max.max(fraction);
        };
        compute_batch(
            &dose,
            &structures,
            &DvhParameters::default(),
            1,
            Some(&progress),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_relative_eq!(*max_seen.lock().unwrap(), 1.0);
    }

    #[test]
    fn stale_generation_is_dropped() {
        let dose = dose_grid();
        let structures = vec![inside_structure()];
        let mut session = Session::new(DvhParameters::default());

        let stale_generation = session.next_generation();
        let stale =
            compute_batch(&dose, &structures, &DvhParameters::default(), stale_generation, None)
                .unwrap();
        // A newer batch supersedes the in-flight one.
        let current_generation = session.next_generation();
        let current =
            compute_batch(&dose, &structures, &DvhParameters::default(), current_generation, None)
                .unwrap();

        assert!(!session.publish(stale));
        assert_eq!(session.table().rows().len(), 0);
        assert!(session.publish(current));
        assert_eq!(session.table().rows().len(), 1);
    }

    #[test]
    fn end_to_end_curve_survives_export_and_reimport() {
        use crate::enums::Delimiter;
        use crate::serializer::{CurveEntry, export_curves, import_curves};

        let dose = dose_grid();
        let structures = vec![inside_structure()];
        let mut session = Session::new(DvhParameters::default());
        session.recompute(&dose, &structures, None).unwrap();

        let result = &session.results()[0];
        let entries = [CurveEntry {
            curve: &result.curve,
            total_volume_cc: result.stats.total_volume_cc,
        }];
        let mut buffer = Vec::new();
        export_curves(&mut buffer, &entries, "Gy", Delimiter::Comma).unwrap();
        let imports = import_curves(buffer.as_slice()).unwrap();

        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].name, "target");
        assert_eq!(imports[0].curve.len(), result.curve.len());
        assert_relative_eq!(imports[0].total_volume_cc, 0.5, epsilon = 1e-9);

        // Metrics queried on the reimported curve agree with the original.
        let before =
            crate::metrics::volume_at_dose_cc(&result.curve, 4.0, result.stats.total_volume_cc)
                .unwrap();
        let after = crate::metrics::volume_at_dose_cc(
            &imports[0].curve,
            4.0,
            imports[0].total_volume_cc,
        )
        .unwrap();
        assert_relative_eq!(before, after, epsilon = 1e-6);
    }

    #[test]
    fn session_recompute_populates_table_and_visibility() {
        let dose = dose_grid();
        let structures = vec![inside_structure(), outside_structure()];
        let mut session = Session::new(DvhParameters::default());
        session.recompute(&dose, &structures, None).unwrap();

        // Failed structures are excluded from the table; the rest populate.
        assert_eq!(session.table().rows().len(), 1);
        assert_eq!(session.failures().len(), 1);
        assert_eq!(session.is_visible("s1"), Some(true));
        assert!(session.set_visible("s1", false));

        session.set_metric_spec(MetricSpec::parse("4", "", ""));
        assert_eq!(session.table().metric_columns().len(), 2);
        // Visibility survives the schema rebuild.
        assert_eq!(session.is_visible("s1"), Some(false));
    }
}
