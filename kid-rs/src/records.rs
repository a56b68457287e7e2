//! Input records supplied by sweep and stream readers.

use crate::error::PipelineError;
use itertools::Itertools;
use ndarray::{Array2, ArrayView1, Axis};
use num_complex::Complex64;
use tracing::warn;

fn check_shape(what: &'static str, expected: (usize, usize), got: (usize, usize)) -> Result<(), PipelineError> {
    if expected.0 != got.0 {
        return Err(PipelineError::ShapeMismatch {
            what,
            expected: expected.0,
            got: got.0,
        });
    }
    if expected.1 != got.1 {
        return Err(PipelineError::ShapeMismatch {
            what,
            expected: expected.1,
            got: got.1,
        });
    }
    Ok(())
}

fn first_non_increasing(values: ArrayView1<'_, f64>) -> Option<usize> {
    values
        .iter()
        .tuple_windows()
        .position(|(a, b)| !(b > a))
        .map(|i| i + 1)
}

/// A frequency sweep: `npts x nch` frequency, I and Q arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    freqs: Array2<f64>,
    i: Array2<f64>,
    q: Array2<f64>,
    i_std: Option<Array2<f64>>,
    q_std: Option<Array2<f64>>,
}

impl SweepRecord {
    /// Validate and wrap sweep arrays.
    ///
    /// Every frequency column must be strictly increasing.
    pub fn try_new(freqs: Array2<f64>, i: Array2<f64>, q: Array2<f64>) -> Result<Self, PipelineError> {
        let dim = freqs.dim();
        if dim.0 == 0 || dim.1 == 0 {
            return Err(PipelineError::ShapeMismatch {
                what: "sweep points",
                expected: 1,
                got: dim.0.min(dim.1),
            });
        }
        check_shape("sweep i", dim, i.dim())?;
        check_shape("sweep q", dim, q.dim())?;
        for (ch, column) in freqs.axis_iter(Axis(1)).enumerate() {
            if let Some(row) = first_non_increasing(column) {
                return Err(PipelineError::NonMonotonic {
                    array: "freqs",
                    column: Some(ch),
                    row,
                });
            }
        }
        Ok(Self {
            freqs,
            i,
            q,
            i_std: None,
            q_std: None,
        })
    }

    /// Attach per-point standard deviations of I and Q.
    pub fn with_std(mut self, i_std: Array2<f64>, q_std: Array2<f64>) -> Result<Self, PipelineError> {
        check_shape("sweep i_std", self.freqs.dim(), i_std.dim())?;
        check_shape("sweep q_std", self.freqs.dim(), q_std.dim())?;
        self.i_std = Some(i_std);
        self.q_std = Some(q_std);
        Ok(self)
    }

    /// Points per channel.
    pub fn n_points(&self) -> usize {
        self.freqs.nrows()
    }

    /// Channel count.
    pub fn n_channels(&self) -> usize {
        self.freqs.ncols()
    }

    /// Frequencies of channel `ch`.
    pub fn freqs(&self, ch: usize) -> Vec<f64> {
        self.freqs.column(ch).to_vec()
    }

    /// Complex samples `I + jQ` of channel `ch`.
    pub fn z(&self, ch: usize) -> Vec<Complex64> {
        self.i
            .column(ch)
            .iter()
            .zip(self.q.column(ch).iter())
            .map(|(i, q)| Complex64::new(*i, *q))
            .collect()
    }

    /// Per-point `(I_std, Q_std)` of channel `ch`, if attached.
    pub fn std(&self, ch: usize) -> Option<Vec<(f64, f64)>> {
        let (i_std, q_std) = (self.i_std.as_ref()?, self.q_std.as_ref()?);
        Some(
            i_std
                .column(ch)
                .iter()
                .zip(q_std.column(ch).iter())
                .map(|(a, b)| (*a, *b))
                .collect(),
        )
    }

    /// Centre frequency of channel `ch`, the middle sample of its column.
    pub fn centre(&self, ch: usize) -> f64 {
        self.freqs[[self.n_points() / 2, ch]]
    }

    /// Frequency span of channel `ch`.
    pub fn span(&self, ch: usize) -> f64 {
        self.freqs[[self.n_points() - 1, ch]] - self.freqs[[0, ch]]
    }

    /// Centre frequencies of all channels.
    pub fn centres(&self) -> Vec<f64> {
        (0..self.n_channels()).map(|ch| self.centre(ch)).collect()
    }
}

/// Streaming IQ capture: `nsamp x nch` I and Q, a packet counter and the
/// sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    i: Array2<f64>,
    q: Array2<f64>,
    packet_count: Vec<u64>,
    sample_rate: f64,
    tone_freqs: Option<Vec<f64>>,
}

impl StreamRecord {
    /// Validate and wrap stream arrays.
    ///
    /// The packet counter must be strictly increasing; gaps are logged.
    pub fn try_new(
        i: Array2<f64>,
        q: Array2<f64>,
        packet_count: Vec<u64>,
        sample_rate: f64,
    ) -> Result<Self, PipelineError> {
        check_shape("stream q", i.dim(), q.dim())?;
        if packet_count.len() != i.nrows() {
            return Err(PipelineError::ShapeMismatch {
                what: "packet_count",
                expected: i.nrows(),
                got: packet_count.len(),
            });
        }
        if let Some(row) = packet_count.windows(2).position(|w| w[1] <= w[0]) {
            return Err(PipelineError::NonMonotonic {
                array: "packet_count",
                column: None,
                row: row + 1,
            });
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(crate::kernel::ConfigError::InvalidArgument {
                arg: "sample_rate",
                reason: "sample_rate must be finite and > 0",
            }
            .into());
        }

        let gaps: Vec<(usize, u64)> = packet_count
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[1] - w[0] > 1)
            .map(|(k, w)| (k + 1, w[1] - w[0] - 1))
            .collect();
        if !gaps.is_empty() {
            let dropped: u64 = gaps.iter().map(|(_, n)| n).sum();
            warn!(
                gaps = gaps.len(),
                dropped,
                first_row = gaps[0].0,
                "packet counter has gaps"
            );
        }

        Ok(Self {
            i,
            q,
            packet_count,
            sample_rate,
            tone_freqs: None,
        })
    }

    /// Attach the readout tone frequency of each channel.
    pub fn with_tone_freqs(mut self, tone_freqs: Vec<f64>) -> Result<Self, PipelineError> {
        if tone_freqs.len() != self.n_channels() {
            return Err(PipelineError::ShapeMismatch {
                what: "tone_freqs",
                expected: self.n_channels(),
                got: tone_freqs.len(),
            });
        }
        self.tone_freqs = Some(tone_freqs);
        Ok(self)
    }

    /// Samples per channel.
    pub fn n_samples(&self) -> usize {
        self.i.nrows()
    }

    /// Channel count.
    pub fn n_channels(&self) -> usize {
        self.i.ncols()
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Packet counter.
    pub fn packet_count(&self) -> &[u64] {
        &self.packet_count
    }

    /// Tone frequency of channel `ch`, if attached.
    pub fn tone_freq(&self, ch: usize) -> Option<f64> {
        self.tone_freqs.as_ref().map(|t| t[ch])
    }

    /// Complex samples `I + jQ` of channel `ch`.
    pub fn z(&self, ch: usize) -> Vec<Complex64> {
        self.i
            .column(ch)
            .iter()
            .zip(self.q.column(ch).iter())
            .map(|(i, q)| Complex64::new(*i, *q))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn sweep_rejects_non_monotonic_column() {
        let freqs = array![[1.0, 10.0], [2.0, 10.0], [3.0, 12.0]];
        let zeros = Array2::zeros((3, 2));
        let err = SweepRecord::try_new(freqs, zeros.clone(), zeros).expect_err("non monotonic");
        assert_eq!(
            err,
            PipelineError::NonMonotonic {
                array: "freqs",
                column: Some(1),
                row: 1
            }
        );
    }

    #[test]
    fn sweep_accessors_follow_columns() {
        let freqs = array![[1.0, 10.0], [2.0, 11.0], [3.0, 13.0]];
        let i = array![[0.1, 1.0], [0.2, 2.0], [0.3, 3.0]];
        let q = array![[-0.1, -1.0], [-0.2, -2.0], [-0.3, -3.0]];
        let sweep = SweepRecord::try_new(freqs, i, q).expect("valid");
        assert_eq!(sweep.n_channels(), 2);
        assert_eq!(sweep.freqs(1), vec![10.0, 11.0, 13.0]);
        assert_eq!(sweep.z(1)[2], Complex64::new(3.0, -3.0));
        assert_eq!(sweep.centre(1), 11.0);
        assert_eq!(sweep.span(1), 3.0);
        assert!(sweep.std(0).is_none());
    }

    #[test]
    fn sweep_std_shape_is_checked() {
        let freqs = array![[1.0], [2.0]];
        let sweep = SweepRecord::try_new(freqs, Array2::zeros((2, 1)), Array2::zeros((2, 1))).expect("valid");
        assert!(matches!(
            sweep.with_std(Array2::zeros((3, 1)), Array2::zeros((2, 1))),
            Err(PipelineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn stream_validates_counter_and_tones() {
        let z = Array2::<f64>::zeros((4, 2));
        assert!(matches!(
            StreamRecord::try_new(z.clone(), z.clone(), vec![0, 1, 1, 2], 100.0),
            Err(PipelineError::NonMonotonic {
                array: "packet_count",
                ..
            })
        ));
        assert!(StreamRecord::try_new(z.clone(), z.clone(), vec![0, 1, 2], 100.0).is_err());
        assert!(StreamRecord::try_new(z.clone(), z.clone(), vec![0, 1, 2, 3], 0.0).is_err());

        let stream = StreamRecord::try_new(z.clone(), z, vec![0, 1, 5, 6], 100.0).expect("gaps are allowed");
        assert!(stream.clone().with_tone_freqs(vec![1.0]).is_err());
        let stream = stream.with_tone_freqs(vec![1.0, 2.0]).expect("matching tones");
        assert_eq!(stream.tone_freq(1), Some(2.0));
    }
}
