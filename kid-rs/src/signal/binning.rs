//! Spectral log-binning and timestream block averaging.

use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle, Read1D, Write1D};
use crate::signal::traits::{BlockAverage1D, LogBin1D};
use core::ops::{Add, Div};
use kid_rs_core::num_rs::logspace;
use num_traits::Zero;

/// Constructor config for [`LogBinKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogBinConfig {
    /// Number of log-spaced bins between `f_min` and `f_max`.
    pub n_bins: usize,
    /// Lower edge of the first bin in Hz.
    pub f_min: f64,
    /// Upper edge of the last bin in Hz.
    pub f_max: f64,
}

impl Default for LogBinConfig {
    fn default() -> Self {
        Self {
            n_bins: 100,
            f_min: 1e-3,
            f_max: 250.0,
        }
    }
}

/// Trait-first log-frequency binning kernel.
///
/// Each bin reports the mean frequency and the mean value of the samples that
/// fall into `[lo, hi)`; bins without samples are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBinKernel {
    edges: Vec<f64>,
}

impl LogBinKernel {
    /// Bin edges, `n_bins + 1` values.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }
}

impl KernelLifecycle for LogBinKernel {
    type Config = LogBinConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if config.n_bins == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "n_bins",
                reason: "n_bins must be > 0",
            });
        }
        if !(config.f_min.is_finite() && config.f_min > 0.0) {
            return Err(ConfigError::InvalidArgument {
                arg: "f_min",
                reason: "f_min must be finite and > 0",
            });
        }
        if !(config.f_max.is_finite() && config.f_max > config.f_min) {
            return Err(ConfigError::InvalidArgument {
                arg: "f_max",
                reason: "f_max must be finite and > f_min",
            });
        }
        Ok(Self {
            edges: logspace(config.f_min.log10(), config.f_max.log10(), config.n_bins + 1),
        })
    }
}

impl LogBin1D for LogBinKernel {
    fn run_alloc<IF, IV>(
        &self,
        freqs: &IF,
        values: &IV,
    ) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        IF: Read1D<f64> + ?Sized,
        IV: Read1D<f64> + ?Sized,
    {
        let freqs = freqs.read_slice()?;
        let values = values.read_slice()?;
        if freqs.len() != values.len() {
            return Err(ExecInvariantViolation::LengthMismatch {
                arg: "values",
                expected: freqs.len(),
                got: values.len(),
            });
        }

        let n_bins = self.edges.len() - 1;
        let mut sum_f = vec![0.0; n_bins];
        let mut sum_v = vec![0.0; n_bins];
        let mut counts = vec![0usize; n_bins];
        let (lo, hi) = (self.edges[0], self.edges[n_bins]);
        for (&f, &v) in freqs.iter().zip(values.iter()) {
            if !v.is_finite() || f < lo || f >= hi {
                continue;
            }
            let bin = (self.edges.partition_point(|e| *e <= f) - 1).min(n_bins - 1);
            sum_f[bin] += f;
            sum_v[bin] += v;
            counts[bin] += 1;
        }

        Ok(counts
            .iter()
            .zip(sum_f.iter().zip(sum_v.iter()))
            .filter(|(n, _)| **n > 0)
            .map(|(n, (f, v))| (f / *n as f64, v / *n as f64))
            .unzip())
    }
}

/// Constructor config for [`BlockAverageKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAverageConfig {
    /// Number of consecutive samples averaged into one output sample.
    pub bin_num: usize,
}

/// Trait-first block-average downsampler. A trailing partial block is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAverageKernel {
    bin_num: usize,
}

impl BlockAverageKernel {
    /// Samples averaged per output sample.
    pub fn factor(&self) -> usize {
        self.bin_num
    }

    /// Output length for an input of `len` samples.
    pub fn output_len(&self, len: usize) -> usize {
        len / self.bin_num
    }
}

impl KernelLifecycle for BlockAverageKernel {
    type Config = BlockAverageConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if config.bin_num == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "bin_num",
                reason: "bin_num must be > 0",
            });
        }
        Ok(Self {
            bin_num: config.bin_num,
        })
    }
}

impl<T> BlockAverage1D<T> for BlockAverageKernel
where
    T: Copy + Zero + Add<Output = T> + Div<f64, Output = T>,
{
    fn run_into<I, O>(&self, input: &I, out: &mut O) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<T> + ?Sized,
        O: Write1D<T> + ?Sized,
    {
        let input = input.read_slice()?;
        let out = out.write_slice_mut()?;
        let expected = self.output_len(input.len());
        if out.len() != expected {
            return Err(ExecInvariantViolation::LengthMismatch {
                arg: "out",
                expected,
                got: out.len(),
            });
        }
        for (o, block) in out.iter_mut().zip(input.chunks_exact(self.bin_num)) {
            *o = block.iter().fold(T::zero(), |acc, v| acc + *v) / self.bin_num as f64;
        }
        Ok(())
    }

    fn run_alloc<I>(&self, input: &I) -> Result<Vec<T>, ExecInvariantViolation>
    where
        I: Read1D<T> + ?Sized,
    {
        let input = input.read_slice()?;
        let mut out = vec![T::zero(); self.output_len(input.len())];
        self.run_into(input, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    #[test]
    fn log_bins_average_members_and_drop_empty_bins() {
        let kernel = LogBinKernel::try_new(LogBinConfig {
            n_bins: 3,
            f_min: 1.0,
            f_max: 1000.0,
        })
        .expect("valid config");
        // bins: [1,10) [10,100) [100,1000)
        let freqs = [0.5, 2.0, 4.0, 200.0, 400.0, 1000.0];
        let values = [9.0, 1.0, 3.0, 10.0, f64::NAN, 7.0];
        let (bf, bv) = kernel.run_alloc(&freqs, &values).expect("binning");
        assert_eq!(bf.len(), 2);
        assert_relative_eq!(bf[0], 3.0);
        assert_relative_eq!(bv[0], 2.0);
        assert_relative_eq!(bf[1], 200.0);
        assert_relative_eq!(bv[1], 10.0);
    }

    #[test]
    fn log_bin_config_is_validated() {
        assert!(LogBinKernel::try_new(LogBinConfig {
            f_min: 0.0,
            ..Default::default()
        })
        .is_err());
        assert!(LogBinKernel::try_new(LogBinConfig {
            f_max: 1e-4,
            ..Default::default()
        })
        .is_err());
        let kernel = LogBinKernel::try_new(LogBinConfig::default()).expect("defaults");
        assert_eq!(kernel.edges().len(), 101);
    }

    #[test]
    fn block_average_complex_drops_partial_block() {
        let kernel = BlockAverageKernel::try_new(BlockAverageConfig { bin_num: 2 }).expect("valid");
        let z = [
            Complex64::new(1.0, 0.0),
            Complex64::new(3.0, 2.0),
            Complex64::new(-1.0, 1.0),
            Complex64::new(1.0, 1.0),
            Complex64::new(100.0, 0.0),
        ];
        let out: Vec<Complex64> = kernel.run_alloc(&z).expect("average");
        assert_eq!(out, vec![Complex64::new(2.0, 1.0), Complex64::new(0.0, 1.0)]);
    }

    #[test]
    fn block_average_validates_output_length() {
        let kernel = BlockAverageKernel::try_new(BlockAverageConfig { bin_num: 3 }).expect("valid");
        let x = [1.0f64; 9];
        let mut out = [0.0f64; 2];
        let err = kernel.run_into(&x, &mut out).expect_err("length mismatch");
        assert!(matches!(
            err,
            ExecInvariantViolation::LengthMismatch {
                arg: "out",
                expected: 3,
                got: 2
            }
        ));
    }
}
