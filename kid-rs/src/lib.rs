//! Readout analysis for kinetic inductance detectors.
//!
//! Swept-frequency and streamed IQ data go through three stages per
//! channel:
//!
//! - [`resonator`]: nonlinear resonator fits (magnitude-only or full IQ).
//! - [`calibrate`]: gain normalization, cable-delay removal, circle fit and
//!   the mapping from stream phase to fractional frequency shift `df/f`.
//! - [`noise`]: PSDs of `df/f` and of the radial/tangential stream
//!   components, log binning and cross-channel common-mode removal.
//!
//! [`pipeline::Pipeline`] runs them over every channel of a batch.
//!
//! ```
//! use kid_rs::config::PipelineConfig;
//! use kid_rs::kernel::KernelLifecycle;
//! use kid_rs::pipeline::{ChannelStatus, Pipeline};
//! use kid_rs::synth::ScenarioConfig;
//!
//! let scenario = ScenarioConfig { n_samples: 512, ..Default::default() }
//!     .generate()
//!     .unwrap();
//! let pipeline = Pipeline::try_new(PipelineConfig {
//!     phase_limit: 3.0,
//!     fit_resonators: false,
//!     ..Default::default()
//! })
//! .unwrap();
//! let out = pipeline
//!     .run(&scenario.fine, &scenario.gain, &scenario.stream)
//!     .unwrap();
//! assert_eq!(out.count(ChannelStatus::Ok), 3);
//! ```

#![warn(missing_docs)]

/// Per-channel IQ calibration.
pub mod calibrate;

/// Batch configuration.
pub mod config;

/// Stage error types.
pub mod error;

/// Shared kernel traits and errors.
pub mod kernel;

/// Least squares, circle fitting and PCA.
pub mod linalg;

/// Noise spectra.
pub mod noise;

/// Batch orchestration.
pub mod pipeline;

/// Sweep and stream records.
pub mod records;

/// Resonator models and fitter.
pub mod resonator;

/// Spectral estimation, binning and peak helpers.
pub mod signal;

/// Statistics over iterators.
pub mod stats;

/// Synthetic readout data.
pub mod synth;

pub use error::{CalibrationError, FitError, PipelineError};
