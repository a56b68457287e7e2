//! Numeric building blocks shared by the `kid-rs` crates.
//!
//! The [`num_rs`] module mirrors the handful of `numpy` routines the
//! calibration pipeline leans on (`unwrap`, `polyfit`, `interp`, `lstsq`,
//! `linspace`, `logspace`).

mod error;
pub use error::*;

/// Numpy-like helpers.
pub mod num_rs;
