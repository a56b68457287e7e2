//! Trait interfaces for signal-processing capabilities.
//!
//! These traits define the trait-first API shape used by the spectral and
//! binning kernels.

use crate::kernel::{ExecInvariantViolation, Read1D, Write1D};

/// One-sided periodogram capability.
pub trait Periodogram1D {
    /// Run into caller-provided frequency and PSD buffers.
    fn run_into<I, OF, OP>(
        &self,
        input: &I,
        freqs: &mut OF,
        pxx: &mut OP,
    ) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
        OF: Write1D<f64> + ?Sized,
        OP: Write1D<f64> + ?Sized;

    /// Run and allocate `(freqs, pxx)`.
    fn run_alloc<I>(&self, input: &I) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized;
}

/// Welch PSD capability.
pub trait WelchPsd1D {
    /// Run into caller-provided frequency and PSD buffers.
    fn run_into<I, OF, OP>(
        &self,
        input: &I,
        freqs: &mut OF,
        pxx: &mut OP,
    ) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
        OF: Write1D<f64> + ?Sized,
        OP: Write1D<f64> + ?Sized;

    /// Run and allocate `(freqs, pxx)`.
    fn run_alloc<I>(&self, input: &I) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized;
}

/// Log-spaced spectral binning capability.
pub trait LogBin1D {
    /// Bin `values` sampled at `freqs`, returning `(bin_centres, bin_means)`.
    ///
    /// Only populated bins are returned.
    fn run_alloc<IF, IV>(
        &self,
        freqs: &IF,
        values: &IV,
    ) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        IF: Read1D<f64> + ?Sized,
        IV: Read1D<f64> + ?Sized;
}

/// Block-average downsampling capability.
pub trait BlockAverage1D<T> {
    /// Average consecutive blocks into a caller-provided output buffer.
    fn run_into<I, O>(&self, input: &I, out: &mut O) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<T> + ?Sized,
        O: Write1D<T> + ?Sized;

    /// Average consecutive blocks and allocate output.
    fn run_alloc<I>(&self, input: &I) -> Result<Vec<T>, ExecInvariantViolation>
    where
        I: Read1D<T> + ?Sized;
}
