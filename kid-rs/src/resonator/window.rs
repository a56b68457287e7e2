//! Per-channel data windows that keep neighbouring resonances out of a fit.

use crate::error::FitError;
use crate::records::SweepRecord;
use num_complex::Complex64;

/// Sweep samples of one channel restricted to its window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSlice {
    /// Frequencies in Hz, increasing.
    pub freqs: Vec<f64>,
    /// Complex samples.
    pub z: Vec<Complex64>,
    /// Per-point `(I_std, Q_std)`.
    pub std: Option<Vec<(f64, f64)>>,
}

impl SweepSlice {
    /// Keep the samples whose frequency satisfies `keep`.
    pub fn select(
        freqs: &[f64],
        z: &[Complex64],
        std: Option<&[(f64, f64)]>,
        keep: impl Fn(f64) -> bool,
    ) -> Self {
        let idx: Vec<usize> = (0..freqs.len()).filter(|&k| keep(freqs[k])).collect();
        Self {
            freqs: idx.iter().map(|&k| freqs[k]).collect(),
            z: idx.iter().map(|&k| z[k]).collect(),
            std: std.map(|s| idx.iter().map(|&k| s[k]).collect()),
        }
    }

    /// Samples and their std divided by `scale(f)`.
    pub fn scaled(&self, scale: impl Fn(f64) -> f64) -> Self {
        let factors: Vec<f64> = self.freqs.iter().map(|f| scale(*f)).collect();
        Self {
            freqs: self.freqs.clone(),
            z: self.z.iter().zip(&factors).map(|(z, s)| *z / *s).collect(),
            std: self.std.as_ref().map(|std| {
                std.iter()
                    .zip(&factors)
                    .map(|((si, sq), s)| (si / s, sq / s))
                    .collect()
            }),
        }
    }

    /// Sample count.
    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    /// `true` when no sample survived.
    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }
}

/// Fine and gain data of one channel inside its window.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWindow {
    /// Channel index.
    pub channel: usize,
    /// Exclusive lower frequency bound.
    pub lower: f64,
    /// Exclusive upper frequency bound.
    pub upper: f64,
    /// Windowed fine sweep.
    pub fine: SweepSlice,
    /// Windowed gain sweep with every resonance region removed.
    pub gain: SweepSlice,
}

impl ChannelWindow {
    /// Both sweeps divided by `scale(f)`.
    pub fn scaled(&self, scale: impl Fn(f64) -> f64 + Copy) -> Self {
        Self {
            channel: self.channel,
            lower: self.lower,
            upper: self.upper,
            fine: self.fine.scaled(scale),
            gain: self.gain.scaled(scale),
        }
    }
}

/// Channel windows derived from the fine-sweep centres.
///
/// Channel `i` keeps frequencies strictly between the midpoints to its nearest
/// lower and higher neighbours. The lowest channel is open down to 0 and the
/// highest up to `+inf`.
#[derive(Debug, Clone, PartialEq)]
pub struct Windowing {
    centres: Vec<f64>,
    half_spans: Vec<f64>,
    bounds: Vec<(f64, f64)>,
}

impl Windowing {
    /// Build windows from channel centres and fine-sweep spans.
    pub fn new(centres: Vec<f64>, spans: &[f64]) -> Self {
        let mut order: Vec<usize> = (0..centres.len()).collect();
        order.sort_by(|&a, &b| centres[a].total_cmp(&centres[b]));

        let mut bounds = vec![(0.0, f64::INFINITY); centres.len()];
        for (rank, &ch) in order.iter().enumerate() {
            let lower = match rank {
                0 => 0.0,
                _ => (centres[order[rank - 1]] + centres[ch]) / 2.0,
            };
            let upper = match order.get(rank + 1) {
                Some(&next) => (centres[ch] + centres[next]) / 2.0,
                None => f64::INFINITY,
            };
            bounds[ch] = (lower, upper);
        }

        Self {
            half_spans: spans.iter().map(|s| s / 2.0).collect(),
            centres,
            bounds,
        }
    }

    /// Windows for every channel of a fine sweep.
    pub fn from_sweep(fine: &SweepRecord) -> Self {
        let spans: Vec<f64> = (0..fine.n_channels()).map(|ch| fine.span(ch)).collect();
        Self::new(fine.centres(), &spans)
    }

    /// `(lower, upper)` exclusive bounds of channel `ch`.
    pub fn bounds(&self, ch: usize) -> (f64, f64) {
        self.bounds[ch]
    }

    /// `true` if `f` lies within half the fine span of any channel centre.
    pub fn near_any_resonance(&self, f: f64) -> bool {
        self.centres
            .iter()
            .zip(&self.half_spans)
            .any(|(c, h)| (f - c).abs() <= *h)
    }

    /// `true` if `f` lies within half the fine span of channel `ch`'s centre.
    pub fn near_resonance(&self, ch: usize, f: f64) -> bool {
        (f - self.centres[ch]).abs() <= self.half_spans[ch]
    }

    /// Cut channel `ch`'s fine and gain data to its window.
    ///
    /// Fails with [`FitError::Windowing`] when fewer than `min_points`
    /// samples survive, or fewer than three fine samples.
    pub fn window(
        &self,
        ch: usize,
        fine: &SweepRecord,
        gain: &SweepRecord,
        min_points: usize,
    ) -> Result<ChannelWindow, FitError> {
        let (lower, upper) = self.bounds(ch);
        let inside = |f: f64| f > lower && f < upper;

        let fine_std = fine.std(ch);
        let fine = SweepSlice::select(&fine.freqs(ch), &fine.z(ch), fine_std.as_deref(), inside);
        let gain_std = gain.std(ch);
        let gain = SweepSlice::select(&gain.freqs(ch), &gain.z(ch), gain_std.as_deref(), |f| {
            inside(f) && !self.near_any_resonance(f)
        });

        let usable = fine.len() + gain.len();
        if usable < min_points || fine.len() < 3 {
            return Err(FitError::Windowing {
                channel: ch,
                usable,
                required: min_points.max(3),
            });
        }
        Ok(ChannelWindow {
            channel: ch,
            lower,
            upper,
            fine,
            gain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sweep(centres: &[f64], half_span: f64, npts: usize) -> SweepRecord {
        let nch = centres.len();
        let freqs = Array2::from_shape_fn((npts, nch), |(k, ch)| {
            centres[ch] - half_span + 2.0 * half_span * k as f64 / (npts - 1) as f64
        });
        let ones = Array2::from_elem((npts, nch), 1.0);
        SweepRecord::try_new(freqs, ones.clone(), ones).expect("valid sweep")
    }

    #[test]
    fn midpoint_bounds_for_three_channels() {
        // deliberately out of frequency order
        let w = Windowing::new(vec![20.0, 10.0, 40.0], &[1.0, 1.0, 1.0]);
        assert_eq!(w.bounds(1), (0.0, 15.0));
        assert_eq!(w.bounds(0), (15.0, 30.0));
        assert_eq!(w.bounds(2), (30.0, f64::INFINITY));
    }

    #[test]
    fn overlapping_fine_sweeps_are_cut_at_midpoints() {
        // fine sweeps +-6 around 100, 110, 130
        let fine = sweep(&[100.0, 110.0, 130.0], 6.0, 13);
        let gain = sweep(&[100.0, 110.0, 130.0], 6.0, 13);
        let w = Windowing::from_sweep(&fine);
        let win = w.window(1, &fine, &gain, 4).expect("enough points");
        assert!(win.fine.freqs.iter().all(|f| *f > 105.0 && *f < 120.0));
        assert_eq!(win.fine.freqs.first().copied(), Some(106.0));
        assert_eq!(win.fine.freqs.last().copied(), Some(116.0));

        let low = w.window(0, &fine, &gain, 4).expect("enough points");
        assert_eq!(low.lower, 0.0);
        assert_eq!(low.fine.freqs.first().copied(), Some(94.0));
        let high = w.window(2, &fine, &gain, 4).expect("enough points");
        assert_eq!(high.upper, f64::INFINITY);
        assert_eq!(high.fine.freqs.last().copied(), Some(136.0));
    }

    #[test]
    fn gain_points_near_any_resonance_are_excluded() {
        let fine = sweep(&[100.0, 110.0], 2.0, 5);
        let freqs = Array2::from_shape_fn((41, 2), |(k, _)| 90.0 + k as f64);
        let ones = Array2::from_elem((41, 2), 1.0);
        let gain = SweepRecord::try_new(freqs, ones.clone(), ones).expect("valid gain");
        let w = Windowing::from_sweep(&fine);
        let win = w.window(0, &fine, &gain, 3).expect("enough points");
        assert!(win
            .gain
            .freqs
            .iter()
            .all(|f| (f - 100.0).abs() > 2.0 && (f - 110.0).abs() > 2.0 && *f < 105.0));
        assert!(!win.gain.is_empty());
    }

    #[test]
    fn too_few_points_is_a_windowing_error() {
        let fine = sweep(&[100.0, 100.5], 2.0, 5);
        let gain = sweep(&[100.0, 100.5], 2.0, 5);
        let w = Windowing::from_sweep(&fine);
        let err = w.window(0, &fine, &gain, 8).expect_err("window too narrow");
        assert!(matches!(err, FitError::Windowing { channel: 0, .. }));
    }
}
