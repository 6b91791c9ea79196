use crate::histogram::DvhCurve;
use crate::stats::MaskedStatistics;

use thiserror::Error;

#[derive(Debug, Clone, Copy, Error)]
pub enum InvalidMetricInputError {
    #[error("structure has no recorded total volume")]
    ZeroTotalVolume,

    #[error("curve has {len} samples, at least 2 are required")]
    TooFewSamples { len: usize },
}

/// Clamped piecewise-linear interpolant over curve samples.
///
/// The table part is built from samples 1..N, which lie on a uniform dose
/// lattice; sample 0 (the origin anchor, or the in-place normalized opening
/// sample) is registered separately as a boundary point. Evaluation outside
/// the covered domain clamps to the nearest end point.
#[derive(Debug, Clone)]
struct PiecewiseLinear {
    points: Vec<(f64, f64)>,
}

impl PiecewiseLinear {
    fn from_curve(curve: &DvhCurve) -> Self {
        let mut points: Vec<(f64, f64)> = curve.samples[1..]
            .iter()
            .map(|s| (s.dose, s.volume_percent))
            .collect();
        let first = &curve.samples[0];
        let at = points.partition_point(|&(x, _)| x < first.dose);
        points.insert(at, (first.dose, first.volume_percent));
        Self { points }
    }

    fn value(&self, x: f64) -> f64 {
        let points = &self.points;
        if x <= points[0].0 {
            return points[0].1;
        }
        let last = points[points.len() - 1];
        if x >= last.0 {
            return last.1;
        }
        for pair in points.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if x <= x1 {
                if x1 == x0 {
                    return y1;
                }
                let t = (x - x0) / (x1 - x0);
                return y0 + (y1 - y0) * t;
            }
        }
        last.1
    }
}

fn validate(curve: &DvhCurve, total_volume_cc: f64) -> Result<(), InvalidMetricInputError> {
    if total_volume_cc == 0.0 {
        return Err(InvalidMetricInputError::ZeroTotalVolume);
    }
    if curve.len() < 2 {
        return Err(InvalidMetricInputError::TooFewSamples { len: curve.len() });
    }
    Ok(())
}

/// Percent of the structure volume receiving at least `dose` (V-metric).
pub fn volume_at_dose(
    curve: &DvhCurve,
    dose: f64,
    total_volume_cc: f64,
) -> Result<f64, InvalidMetricInputError> {
    validate(curve, total_volume_cc)?;
    Ok(PiecewiseLinear::from_curve(curve).value(dose))
}

/// Absolute volume in cc receiving at least `dose` (V-metric).
pub fn volume_at_dose_cc(
    curve: &DvhCurve,
    dose: f64,
    total_volume_cc: f64,
) -> Result<f64, InvalidMetricInputError> {
    Ok(volume_at_dose(curve, dose, total_volume_cc)? * total_volume_cc / 100.0)
}

/// Minimum dose received by at least the given volume (D-metric). `volume`
/// is a percentage of the structure volume when `is_percent` is set,
/// otherwise an absolute volume in cc.
pub fn dose_at_volume(
    curve: &DvhCurve,
    volume: f64,
    is_percent: bool,
    total_volume_cc: f64,
) -> Result<f64, InvalidMetricInputError> {
    validate(curve, total_volume_cc)?;

    let volume_cc = if is_percent {
        volume * total_volume_cc / 100.0
    } else {
        volume
    };
    let sample_cc = |percent: f64| percent / 100.0 * total_volume_cc;

    let samples = &curve.samples;
    let last = &samples[samples.len() - 1];
    // At or above the top plateau: no dose level holds that much volume.
    if volume_cc >= sample_cc(samples[0].volume_percent) {
        return Ok(0.0);
    }
    // Below the lowest recorded volume: the whole structure receives at
    // least the last sampled dose.
    if volume_cc < sample_cc(last.volume_percent) {
        return Ok(last.dose);
    }
    for pair in samples.windows(2) {
        let volume_previous = sample_cc(pair[0].volume_percent);
        let volume_next = sample_cc(pair[1].volume_percent);
        if volume_previous > volume_cc && volume_cc >= volume_next {
            let t = (volume_cc - volume_previous) / (volume_next - volume_previous);
            return Ok(pair[0].dose + (pair[1].dose - pair[0].dose) * t);
        }
    }
    Ok(last.dose)
}

/// Percent of `compare`'s bins agreeing with `reference` under the gamma
/// criterion of Ebert 2010.
///
/// For each compare point `(di, vi)` the gamma against a reference point
/// `(dr, vr)` is
///
/// ```text
/// sqrt( ((100 * (vr - vi)) / (volume_difference_criterion * total_volume))^2
///     + ((100 * (dr - di)) / (dose_to_agreement_criterion * max_dose))^2 )
/// ```
///
/// with volumes in cc; the bin agrees when the minimum gamma over all
/// reference points is below 1. `volume_difference_criterion` is a percent of
/// the total structure volume, `dose_to_agreement_criterion` a percent of
/// `max_dose`.
pub fn compare_curves(
    reference: &DvhCurve,
    compare: &DvhCurve,
    total_volume_cc: f64,
    max_dose: f64,
    volume_difference_criterion: f64,
    dose_to_agreement_criterion: f64,
) -> f64 {
    if reference.is_empty() || compare.is_empty() {
        return 0.0;
    }
    let to_cc = |percent: f64| percent / 100.0 * total_volume_cc;

    let agreements = compare
        .samples
        .iter()
        .filter(|sample| {
            let vi = to_cc(sample.volume_percent);
            let gamma = reference
                .samples
                .iter()
                .map(|r| {
                    let volume_term = 100.0 * (to_cc(r.volume_percent) - vi)
                        / (volume_difference_criterion * total_volume_cc);
                    let dose_term =
                        100.0 * (r.dose - sample.dose) / (dose_to_agreement_criterion * max_dose);
                    volume_term.hypot(dose_term)
                })
                .fold(f64::INFINITY, f64::min);
            gamma < 1.0
        })
        .count();

    agreements as f64 / compare.len() as f64 * 100.0
}

/// Parse a comma-separated list of metric values such as `"5, 10, 20"`.
/// Invalid entries are skipped with a warning rather than failing the list.
pub fn parse_metric_values(text: &str) -> Vec<f64> {
    let mut values = Vec::new();
    for field in text.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        match field.parse::<f64>() {
            Ok(value) => values.push(value),
            Err(_) => log::warn!("invalid metric value in string: '{field}'"),
        }
    }
    values
}

/// The set of V/D metric columns to compute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSpec {
    /// Dose thresholds for V-metrics.
    pub v_doses: Vec<f64>,
    /// Emit V-metric columns in cc.
    pub v_cc: bool,
    /// Emit V-metric columns in percent.
    pub v_percent: bool,
    /// Absolute volume thresholds (cc) for D-metrics.
    pub d_volumes_cc: Vec<f64>,
    /// Relative volume thresholds (percent) for D-metrics.
    pub d_volumes_percent: Vec<f64>,
}

impl MetricSpec {
    /// Build a spec from user-entered value lists. V-metric columns are
    /// enabled in both units whenever dose thresholds are present.
    pub fn parse(v_doses: &str, d_volumes_cc: &str, d_volumes_percent: &str) -> Self {
        let v_doses = parse_metric_values(v_doses);
        let has_v = !v_doses.is_empty();
        Self {
            v_doses,
            v_cc: has_v,
            v_percent: has_v,
            d_volumes_cc: parse_metric_values(d_volumes_cc),
            d_volumes_percent: parse_metric_values(d_volumes_percent),
        }
    }

    /// Column names for this spec, in computation order.
    pub fn column_names(&self, dose_unit: Option<&str>) -> Vec<String> {
        let unit_postfix = match dose_unit {
            Some(unit) => format!(" ({unit})"),
            None => String::new(),
        };
        let mut names = Vec::new();
        for &dose in &self.v_doses {
            if self.v_cc {
                names.push(format!("V{} (cc)", format_threshold(dose)));
            }
            if self.v_percent {
                names.push(format!("V{} (%)", format_threshold(dose)));
            }
        }
        for &volume in &self.d_volumes_cc {
            names.push(format!("D{}cc{unit_postfix}", format_threshold(volume)));
        }
        for &volume in &self.d_volumes_percent {
            names.push(format!("D{}%{unit_postfix}", format_threshold(volume)));
        }
        names
    }
}

fn format_threshold(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e9 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// A metric cell. Values that could not be computed for a structure are
/// marked explicitly so every row keeps the full shared column set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Value(f64),
    NotComputed,
}

#[derive(Debug, Clone)]
pub struct MetricsRow {
    pub structure_id: String,
    pub name: String,
    /// Read by external chart collaborators; carried, never interpreted here.
    pub visible: bool,
    pub dose_volume_name: String,
    pub volume_cc: f64,
    pub mean_dose: MetricValue,
    pub min_dose: MetricValue,
    pub max_dose: MetricValue,
    pub metric_values: Vec<MetricValue>,
}

/// One row per structure with a computed curve; the dynamic V/D column set
/// is shared by all rows and replaced wholesale when the spec changes.
#[derive(Debug, Clone, Default)]
pub struct MetricsTable {
    pub dose_unit: Option<String>,
    metric_columns: Vec<String>,
    rows: Vec<MetricsRow>,
}

impl MetricsTable {
    /// Static column names ahead of the dynamic metric columns.
    pub fn static_column_names(&self) -> Vec<String> {
        let value_kind = match &self.dose_unit {
            Some(unit) => format!("dose ({unit})"),
            None => "intensity".to_string(),
        };
        vec![
            "Show".to_string(),
            "Structure".to_string(),
            "Volume name".to_string(),
            "Volume (cc)".to_string(),
            format!("Mean {value_kind}"),
            format!("Min {value_kind}"),
            format!("Max {value_kind}"),
        ]
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut names = self.static_column_names();
        names.extend(self.metric_columns.iter().cloned());
        names
    }

    pub fn metric_columns(&self) -> &[String] {
        &self.metric_columns
    }

    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    pub fn is_visible(&self, structure_id: &str) -> Option<bool> {
        self.rows
            .iter()
            .find(|row| row.structure_id == structure_id)
            .map(|row| row.visible)
    }

    pub fn set_visible(&mut self, structure_id: &str, visible: bool) -> bool {
        match self
            .rows
            .iter_mut()
            .find(|row| row.structure_id == structure_id)
        {
            Some(row) => {
                row.visible = visible;
                true
            }
            None => false,
        }
    }
}

/// Everything the table rebuild needs for one structure.
#[derive(Debug, Clone, Copy)]
pub struct StructureRecord<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub curve: &'a DvhCurve,
    pub total_volume_cc: f64,
    /// Absent for curves reconstructed from a serialized table.
    pub stats: Option<&'a MaskedStatistics>,
    pub visible: bool,
}

/// Rebuild the metrics table from scratch: the schema is derived from the
/// spec, then every row is repopulated. Per-structure query failures become
/// explicit not-computed cells and never abort the rebuild.
pub fn recompute_metrics_table(
    records: &[StructureRecord<'_>],
    spec: &MetricSpec,
    dose_unit: Option<&str>,
    dose_volume_name: &str,
) -> MetricsTable {
    let metric_columns = spec.column_names(dose_unit);

    let rows = records
        .iter()
        .map(|record| {
            let mut metric_values = Vec::with_capacity(metric_columns.len());
            for &dose in &spec.v_doses {
                let percent = volume_at_dose(record.curve, dose, record.total_volume_cc);
                if spec.v_cc {
                    metric_values.push(to_metric_value(
                        percent.map(|p| p * record.total_volume_cc / 100.0),
                        record.name,
                    ));
                }
                if spec.v_percent {
                    metric_values.push(to_metric_value(percent, record.name));
                }
            }
            for &volume in &spec.d_volumes_cc {
                metric_values.push(to_metric_value(
                    dose_at_volume(record.curve, volume, false, record.total_volume_cc),
                    record.name,
                ));
            }
            for &volume in &spec.d_volumes_percent {
                metric_values.push(to_metric_value(
                    dose_at_volume(record.curve, volume, true, record.total_volume_cc),
                    record.name,
                ));
            }

            MetricsRow {
                structure_id: record.id.to_string(),
                name: record.name.to_string(),
                visible: record.visible,
                dose_volume_name: dose_volume_name.to_string(),
                volume_cc: record.total_volume_cc,
                mean_dose: stat_value(record.stats, |s| s.mean_dose),
                min_dose: stat_value(record.stats, |s| s.min_dose),
                max_dose: stat_value(record.stats, |s| s.max_dose),
                metric_values,
            }
        })
        .collect();

    MetricsTable {
        dose_unit: dose_unit.map(str::to_string),
        metric_columns,
        rows,
    }
}

fn to_metric_value(result: Result<f64, InvalidMetricInputError>, name: &str) -> MetricValue {
    match result {
        Ok(value) => MetricValue::Value(value),
        Err(error) => {
            log::warn!("metric not computed for structure '{name}': {error}");
            MetricValue::NotComputed
        }
    }
}

fn stat_value(stats: Option<&MaskedStatistics>, get: impl Fn(&MaskedStatistics) -> f64) -> MetricValue {
    match stats {
        Some(stats) => MetricValue::Value(get(stats)),
        None => MetricValue::NotComputed,
    }
}
