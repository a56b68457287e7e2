use crate::error::CalibrationError;
use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle};
use crate::signal::binning::{BlockAverageConfig, BlockAverageKernel};
use crate::signal::traits::BlockAverage1D;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Constructor config for [`StreamPreprocessor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPreprocessorConfig {
    /// Samples dropped from the start of the capture.
    pub skip_beginning: usize,
    /// Block-average factor applied after skipping.
    pub bin_num: Option<usize>,
}

/// Time axes of a preprocessed capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTiming {
    /// Seconds since the first packet, from the packet counter.
    pub time: Vec<f64>,
    /// Seconds since the first raw sample, from the sample index.
    pub stream_time: Vec<f64>,
    /// Sample rate after block averaging, Hz.
    pub sample_rate: f64,
}

/// Skip-then-block-average stream preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPreprocessor {
    skip: usize,
    bin: Option<BlockAverageKernel>,
}

impl KernelLifecycle for StreamPreprocessor {
    type Config = StreamPreprocessorConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        let bin = config
            .bin_num
            .map(|bin_num| BlockAverageKernel::try_new(BlockAverageConfig { bin_num }))
            .transpose()?;
        Ok(Self {
            skip: config.skip_beginning,
            bin,
        })
    }
}

impl StreamPreprocessor {
    fn reduce<T>(&self, kept: &[T]) -> Result<Vec<T>, CalibrationError>
    where
        BlockAverageKernel: BlockAverage1D<T>,
        T: Clone,
    {
        match &self.bin {
            Some(kernel) => Ok(kernel.run_alloc(kept)?),
            None => Ok(kept.to_vec()),
        }
    }

    fn kept<'a, T>(&self, samples: &'a [T]) -> Result<&'a [T], CalibrationError> {
        samples
            .get(self.skip..)
            .filter(|s| !s.is_empty())
            .ok_or(CalibrationError::Degenerate {
                stage: "stream preprocessing",
                reason: "skip_beginning removes every sample",
            })
    }

    /// Preprocess one channel's complex samples.
    pub fn samples(&self, z: &[Complex64]) -> Result<Vec<Complex64>, CalibrationError> {
        let out = self.reduce(self.kept(z)?)?;
        if out.is_empty() {
            return Err(CalibrationError::Degenerate {
                stage: "stream preprocessing",
                reason: "bin_num exceeds the remaining sample count",
            });
        }
        Ok(out)
    }

    /// Output length for a capture of `n_samples`, or the argument that
    /// leaves nothing to process.
    pub fn output_len(&self, n_samples: usize) -> Result<usize, ConfigError> {
        let kept = n_samples.saturating_sub(self.skip);
        if kept == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "skip_beginning",
                reason: "skip_beginning removes every sample",
            });
        }
        let out = self.bin.map_or(kept, |k| k.output_len(kept));
        if out == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "bin_num",
                reason: "bin_num exceeds the remaining sample count",
            });
        }
        Ok(out)
    }

    fn average_axis(&self, axis: &[f64]) -> Result<Vec<f64>, ConfigError> {
        let kept = &axis[self.skip..];
        match &self.bin {
            Some(kernel) => kernel.run_alloc(kept).map_err(|err| match err {
                ExecInvariantViolation::Config(cfg) => cfg,
                _ => ConfigError::LengthMismatch {
                    arg: "packet_count",
                    expected: self.output_len(axis.len()).unwrap_or(0),
                    got: 0,
                },
            }),
            None => Ok(kept.to_vec()),
        }
    }

    /// Time axes matching [`Self::samples`] output.
    pub fn timing(&self, packet_count: &[u64], sample_rate: f64) -> Result<StreamTiming, ConfigError> {
        self.output_len(packet_count.len())?;
        let first = packet_count.first().copied().unwrap_or(0);
        let packet_time: Vec<f64> = packet_count
            .iter()
            .map(|p| (p - first) as f64 / sample_rate)
            .collect();
        let index_time: Vec<f64> = (0..packet_count.len())
            .map(|k| k as f64 / sample_rate)
            .collect();
        let time = self.average_axis(&packet_time)?;
        let stream_time = self.average_axis(&index_time)?;
        let factor = self.bin.map_or(1, |k| k.factor());
        Ok(StreamTiming {
            time,
            stream_time,
            sample_rate: sample_rate / factor as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skip_then_average() {
        let pre = StreamPreprocessor::try_new(StreamPreprocessorConfig {
            skip_beginning: 1,
            bin_num: Some(2),
        })
        .expect("valid");
        let z: Vec<Complex64> = (0..6).map(|k| Complex64::new(k as f64, -(k as f64))).collect();
        let out = pre.samples(&z).expect("samples");
        assert_eq!(out, vec![Complex64::new(1.5, -1.5), Complex64::new(3.5, -3.5)]);

        let timing = pre.timing(&[10, 11, 12, 14, 15, 16], 2.0).expect("timing");
        assert_relative_eq!(timing.sample_rate, 1.0);
        assert_eq!(timing.time, vec![0.75, 2.25]);
        assert_eq!(timing.stream_time, vec![0.75, 1.75]);
    }

    #[test]
    fn skipping_everything_is_degenerate() {
        let pre = StreamPreprocessor::try_new(StreamPreprocessorConfig {
            skip_beginning: 4,
            bin_num: None,
        })
        .expect("valid");
        assert!(pre.samples(&[Complex64::new(0.0, 0.0); 4]).is_err());
        assert!(matches!(
            pre.timing(&[0, 1, 2, 3], 10.0),
            Err(ConfigError::InvalidArgument {
                arg: "skip_beginning",
                ..
            })
        ));
    }

    #[test]
    fn oversized_bin_is_reported_against_bin_num() {
        let pre = StreamPreprocessor::try_new(StreamPreprocessorConfig {
            skip_beginning: 1,
            bin_num: Some(8),
        })
        .expect("valid");
        assert_eq!(pre.output_len(9), Ok(1));
        assert!(matches!(
            pre.timing(&[0, 1, 2, 3, 4, 5], 10.0),
            Err(ConfigError::InvalidArgument { arg: "bin_num", .. })
        ));
    }

    #[test]
    fn zero_bin_num_is_rejected() {
        assert!(StreamPreprocessor::try_new(StreamPreprocessorConfig {
            skip_beginning: 0,
            bin_num: Some(0),
        })
        .is_err());
    }
}
