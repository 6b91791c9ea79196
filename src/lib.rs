//! # DVH computation library
//!
//! This crate computes cumulative dose-volume histograms (DVH) for
//! radiotherapy structures, along with the dose/volume metrics derived from
//! them.
//!
//! A DVH answers the question "how much of this structure receives at least
//! this dose?". The input is a scalar dose grid and, per structure, a binary
//! mask; both are reconciled onto a shared oversampled geometry before any
//! counting happens, so partial-volume effects at structure boundaries stay
//! small. From the reconciled pair the crate produces:
//!  - per-structure dose statistics (volume, min, max, mean)
//!  - the cumulative percent-volume curve itself
//!  - V-metrics (volume receiving at least a dose) and D-metrics (minimum
//!    dose received by at least a volume), assembled into a metrics table
//!
//! Structures are computed in parallel using rayon, one independent unit of
//! work per structure; a structure lying outside the dose field fails on its
//! own without aborting the batch. Curves can be exported to and re-imported
//! from delimited text without loss.
//!
//! # Examples
//!
//! ## Computing a DVH for one structure
//!
//! Build a dose grid and a mask, run a batch, and export the resulting
//! curve as CSV.
//!
//! ```no_run
//! # use dvh_core::grid::{Geometry, MaskGrid, ScalarGrid};
//! # use dvh_core::pipeline::{DvhParameters, Session, Structure};
//! # use dvh_core::serializer::{CurveEntry, export_curves_to_path};
//! # use dvh_core::enums::Delimiter;
//! # use ndarray::Array3;
//! let geometry = Geometry::new((64, 128, 128), (2.0, 2.0, 2.5), (-128.0, -128.0, -80.0));
//! let dose = ScalarGrid::new(Array3::zeros((64, 128, 128)), geometry.clone());
//! let mask = MaskGrid::new(Array3::from_elem((64, 128, 128), false), geometry);
//! let structure = Structure::new("1", "PTV", mask);
//!
//! let mut session = Session::new(DvhParameters::default());
//! session
//!     .recompute(&dose, &[structure], None)
//!     .expect("oversampling configuration should be valid");
//! let entries: Vec<CurveEntry> = session
//!     .results()
//!     .iter()
//!     .map(|r| CurveEntry {
//!         curve: &r.curve,
//!         total_volume_cc: r.stats.total_volume_cc,
//!     })
//!     .collect();
//! export_curves_to_path("dvh.csv", &entries, "Gy", Delimiter::Comma)
//!     .expect("should have written the curve table");
//! ```

pub mod enums;
pub mod grid;
pub mod histogram;
pub mod metrics;
pub mod pipeline;
pub mod resample;
pub mod serializer;
pub mod stats;
