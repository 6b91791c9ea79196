use crate::enums::Delimiter;
use crate::histogram::{DvhCurve, DvhSample};
use crate::metrics::{MetricValue, MetricsTable};

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const HEADER_DOSE_FIELD_START: &str = " Dose (";
const HEADER_VOLUME_FIELD_MIDDLE: &str = " Value (% of ";
const HEADER_VOLUME_FIELD_END: &str = " cc)";

#[derive(Debug, Error)]
pub enum SerializationFormatError {
    #[error(
        "malformed header field '{field}': expected \"<name> Value (% of <volume> cc)\""
    )]
    MalformedHeader { field: String },

    #[error("header fields must come in (dose, value) pairs, found {count}")]
    UnpairedHeader { count: usize },

    #[error("file contains no header row")]
    MissingHeader,

    #[error("malformed numeric field '{field}' on line {line}")]
    MalformedNumber { line: usize, field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A curve paired with its structure's total volume, the unit the export
/// header needs alongside the percent samples.
#[derive(Debug, Clone, Copy)]
pub struct CurveEntry<'a> {
    pub curve: &'a DvhCurve,
    pub total_volume_cc: f64,
}

/// A curve reconstructed from a serialized table.
#[derive(Debug, Clone)]
pub struct ImportedDvh {
    pub name: String,
    pub total_volume_cc: f64,
    pub curve: DvhCurve,
}

/// Write curves as a delimited table: two header fields and two value
/// columns per structure, samples with 6 decimal digits, shorter curves
/// leaving trailing cells blank. No quoting is applied, so structure names
/// containing the delimiter are the caller's responsibility to avoid.
pub fn export_curves<W: Write>(
    writer: &mut W,
    entries: &[CurveEntry<'_>],
    dose_unit: &str,
    delimiter: Delimiter,
) -> Result<(), SerializationFormatError> {
    let sep = delimiter.as_char();

    for entry in entries {
        let name = &entry.curve.name;
        write!(writer, "{name}{HEADER_DOSE_FIELD_START}{dose_unit}){sep}")?;
        write!(
            writer,
            "{name}{HEADER_VOLUME_FIELD_MIDDLE}{:.3}{HEADER_VOLUME_FIELD_END}{sep}",
            entry.total_volume_cc
        )?;
    }
    writeln!(writer)?;

    let max_len = entries.iter().map(|e| e.curve.len()).max().unwrap_or(0);
    for row in 0..max_len {
        for entry in entries {
            match entry.curve.samples.get(row) {
                Some(sample) => {
                    write!(
                        writer,
                        "{}{sep}{}{sep}",
                        format_sample(sample.dose, delimiter),
                        format_sample(sample.volume_percent, delimiter)
                    )?;
                }
                None => write!(writer, "{sep}{sep}")?,
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}

pub fn export_curves_to_path(
    path: impl AsRef<Path>,
    entries: &[CurveEntry<'_>],
    dose_unit: &str,
    delimiter: Delimiter,
) -> Result<(), SerializationFormatError> {
    let mut writer = BufWriter::new(File::create(path)?);
    export_curves(&mut writer, entries, dose_unit, delimiter)?;
    writer.flush()?;
    Ok(())
}

/// Read curves back from a delimited table. The delimiter is detected from
/// the header row. A malformed header fails the whole file; partial
/// reconstruction would risk attributing columns to the wrong structure.
pub fn import_curves<R: BufRead>(
    reader: R,
) -> Result<Vec<ImportedDvh>, SerializationFormatError> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => return Err(SerializationFormatError::MissingHeader),
    };
    let delimiter = if header.contains('\t') {
        Delimiter::Tab
    } else {
        Delimiter::Comma
    };
    let sep = delimiter.as_char();

    let header_fields = split_fields(&header, sep);
    if header_fields.is_empty() {
        return Err(SerializationFormatError::MissingHeader);
    }
    if header_fields.len() % 2 != 0 {
        return Err(SerializationFormatError::UnpairedHeader {
            count: header_fields.len(),
        });
    }

    let mut imports = Vec::with_capacity(header_fields.len() / 2);
    for pair in header_fields.chunks(2) {
        let value_field = pair[1];
        let middle = value_field
            .find(HEADER_VOLUME_FIELD_MIDDLE)
            .filter(|_| value_field.ends_with(HEADER_VOLUME_FIELD_END))
            .ok_or_else(|| SerializationFormatError::MalformedHeader {
                field: value_field.to_string(),
            })?;
        let name = value_field[..middle].to_string();
        let volume_text = &value_field
            [middle + HEADER_VOLUME_FIELD_MIDDLE.len()..value_field.len() - HEADER_VOLUME_FIELD_END.len()];
        // The header volume always uses a decimal point, even in
        // tab-delimited files.
        let total_volume_cc = volume_text.trim().parse::<f64>().map_err(|_| {
            SerializationFormatError::MalformedHeader {
                field: value_field.to_string(),
            }
        })?;
        imports.push(ImportedDvh {
            curve: DvhCurve::new(name.clone(), Vec::new()),
            name,
            total_volume_cc,
        });
    }

    for (line_index, line) in lines.enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let fields = split_fields(&line, sep);
        for (structure, pair) in imports.iter_mut().zip(fields.chunks(2)) {
            let dose_text = pair[0].trim();
            let volume_text = pair.get(1).copied().unwrap_or("").trim();
            if dose_text.is_empty() && volume_text.is_empty() {
                // This structure's curve is shorter than the table.
                continue;
            }
            let dose = parse_sample(dose_text, delimiter, line_index + 2)?;
            let volume_percent = parse_sample(volume_text, delimiter, line_index + 2)?;
            structure.curve.samples.push(DvhSample {
                dose,
                volume_percent,
            });
        }
    }

    Ok(imports)
}

pub fn import_curves_from_path(
    path: impl AsRef<Path>,
) -> Result<Vec<ImportedDvh>, SerializationFormatError> {
    import_curves(BufReader::new(File::open(path)?))
}

/// Write the metrics table as a plain delimited table, one row per
/// structure, without the visibility and dose-volume-name columns.
pub fn export_metrics<W: Write>(
    writer: &mut W,
    table: &MetricsTable,
    delimiter: Delimiter,
) -> Result<(), SerializationFormatError> {
    let sep = delimiter.as_char();

    let columns: Vec<String> = table
        .column_names()
        .into_iter()
        .filter(|name| name != "Show" && name != "Volume name")
        .collect();
    writeln!(writer, "{}", columns.join(&sep.to_string()))?;

    for row in table.rows() {
        write!(writer, "{}{sep}{}", row.name, row.volume_cc)?;
        for value in [&row.mean_dose, &row.min_dose, &row.max_dose]
            .into_iter()
            .chain(row.metric_values.iter())
        {
            match value {
                MetricValue::Value(v) => write!(writer, "{sep}{v}")?,
                MetricValue::NotComputed => write!(writer, "{sep}")?,
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}

pub fn export_metrics_to_path(
    path: impl AsRef<Path>,
    table: &MetricsTable,
    delimiter: Delimiter,
) -> Result<(), SerializationFormatError> {
    let mut writer = BufWriter::new(File::create(path)?);
    export_metrics(&mut writer, table, delimiter)?;
    writer.flush()?;
    Ok(())
}

fn format_sample(value: f64, delimiter: Delimiter) -> String {
    let text = format!("{value:.6}");
    if delimiter.uses_decimal_comma() {
        text.replace('.', ",")
    } else {
        text
    }
}

fn parse_sample(
    text: &str,
    delimiter: Delimiter,
    line: usize,
) -> Result<f64, SerializationFormatError> {
    let normalized;
    let text = if delimiter.uses_decimal_comma() {
        normalized = text.replace(',', ".");
        &normalized
    } else {
        text
    };
    text.parse::<f64>()
        .map_err(|_| SerializationFormatError::MalformedNumber {
            line,
            field: text.to_string(),
        })
}

/// Split a record into fields, dropping the empty tail left by the trailing
/// delimiter the export writes after every field.
fn split_fields(line: &str, sep: char) -> Vec<&str> {
    let mut fields: Vec<&str> = line.split(sep).collect();
    if fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }
    fields
}
