use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};

/// Quadratic map from resonance-circle phase to sweep frequency.
///
/// Built from fine-sweep samples whose phase lies inside `(-limit, limit)`,
/// sorted by phase with repeated phases dropped. Each query uses the
/// three-point Lagrange polynomial through the nearest samples. Queries
/// outside the sampled phase range have no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseToFrequency {
    phases: Vec<f64>,
    freqs: Vec<f64>,
}

impl PhaseToFrequency {
    /// Build the map from paired fine-sweep phases and frequencies.
    pub fn try_new(phases: &[f64], freqs: &[f64], limit: f64) -> Result<Self, CalibrationError> {
        let mut pairs: Vec<(f64, f64)> = phases
            .iter()
            .zip(freqs)
            .filter(|(p, f)| p.abs() < limit && f.is_finite())
            .map(|(p, f)| (*p, *f))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        pairs.dedup_by(|b, a| b.0 == a.0);
        if pairs.len() < 3 {
            return Err(CalibrationError::Degenerate {
                stage: "phase interpolant",
                reason: "fewer than three fine points inside the phase window",
            });
        }
        let (phases, freqs) = pairs.into_iter().unzip();
        Ok(Self { phases, freqs })
    }

    /// Closed phase interval covered by the map.
    pub fn domain(&self) -> (f64, f64) {
        (self.phases[0], self.phases[self.phases.len() - 1])
    }

    /// Frequency at `phase`, `None` outside [`Self::domain`].
    pub fn eval(&self, phase: f64) -> Option<f64> {
        let (lo, hi) = self.domain();
        if !(phase >= lo && phase <= hi) {
            return None;
        }
        let n = self.phases.len();
        let idx = self.phases.partition_point(|p| *p <= phase).max(1);
        let s = (idx - 1).min(n - 3);
        let (x0, x1, x2) = (self.phases[s], self.phases[s + 1], self.phases[s + 2]);
        let (y0, y1, y2) = (self.freqs[s], self.freqs[s + 1], self.freqs[s + 2]);
        let l0 = (phase - x1) * (phase - x2) / ((x0 - x1) * (x0 - x2));
        let l1 = (phase - x0) * (phase - x2) / ((x1 - x0) * (x1 - x2));
        let l2 = (phase - x0) * (phase - x1) / ((x2 - x0) * (x2 - x1));
        Some(y0 * l0 + y1 * l1 + y2 * l2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic_data_is_reproduced_exactly() {
        let phases: Vec<f64> = (0..15).map(|k| -1.4 + 0.2 * k as f64).collect();
        let freqs: Vec<f64> = phases.iter().map(|p| 4.0e9 + 1.0e5 * p + 3.0e3 * p * p).collect();
        let map = PhaseToFrequency::try_new(&phases, &freqs, core::f64::consts::FRAC_PI_2).expect("valid");
        for &p in &[-1.35, -0.05, 0.0, 0.33, 1.39] {
            let expected = 4.0e9 + 1.0e5 * p + 3.0e3 * p * p;
            assert_relative_eq!(map.eval(p).expect("in domain"), expected, max_relative = 1e-12);
        }
    }

    #[test]
    fn samples_outside_the_window_are_dropped_and_queries_fail() {
        // decreasing frequency with phase, as on a real resonance circle
        let phases = [2.0, 1.2, 0.6, 0.0, -0.6, -1.2, -2.0, 0.6];
        let freqs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 3.5];
        let map = PhaseToFrequency::try_new(&phases, &freqs, core::f64::consts::FRAC_PI_2).expect("valid");
        assert_eq!(map.domain(), (-1.2, 1.2));
        assert!(map.eval(1.3).is_none());
        assert!(map.eval(f64::NAN).is_none());
        assert_relative_eq!(map.eval(0.0).expect("in domain"), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn too_few_points_is_degenerate() {
        let err = PhaseToFrequency::try_new(&[0.1, 2.0, 0.1], &[1.0, 2.0, 3.0], 1.5).expect_err("degenerate");
        assert!(matches!(err, CalibrationError::Degenerate { .. }));
    }
}
