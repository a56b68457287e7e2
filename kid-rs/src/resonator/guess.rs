//! Initial parameter estimates from windowed sweep data.

use crate::resonator::window::SweepSlice;
use crate::signal::peak::{find_peaks, peak_prominences, peak_widths, FindPeaksOptions};
use core::f64::consts::PI;
use kid_rs_core::num_rs::{interp, unwrap, Polynomial};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Qr used when the dip width cannot be measured.
pub const FALLBACK_QR: f64 = 1e4;

/// Nonlinearity values tried when seeding `a`.
pub const NONLINEARITY_SCAN: [f64; 6] = [0.0, 0.05, 0.1, 0.2, 0.4, 0.6];

/// Resonance dip located in a fine sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DipEstimate {
    /// Sample index of the dip.
    pub index: usize,
    /// Frequency of the dip.
    pub fr: f64,
    /// Loaded quality factor `fr / fwhm`.
    pub qr: f64,
    /// Minimum `|z|`.
    pub min_mag: f64,
    /// Width from the dip to the left half-depth crossing, Hz.
    pub left_half_width: f64,
    /// Width from the dip to the right half-depth crossing, Hz.
    pub right_half_width: f64,
}

impl DipEstimate {
    /// Full width at half depth in Hz.
    pub fn fwhm(&self) -> f64 {
        self.left_half_width + self.right_half_width
    }
}

/// Locate the deepest dip of `|z|^2` and measure its half-depth widths.
///
/// The most prominent interior minimum wins; a monotonic trace falls back to
/// its global minimum.
pub fn estimate_dip(fine: &SweepSlice) -> DipEstimate {
    let inverted: Vec<f64> = fine.z.iter().map(|z| -z.norm_sqr()).collect();
    let candidates = find_peaks(&inverted, FindPeaksOptions::default());
    let index = if candidates.is_empty() {
        inverted
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(k, _)| k)
    } else {
        let prom = peak_prominences(&inverted, &candidates);
        candidates
            .iter()
            .zip(&prom.prominences)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(candidates[0], |(k, _)| *k)
    };

    let fr = fine.freqs[index];
    let widths = peak_widths(&inverted, &[index], 0.5);
    let axis: Vec<f64> = (0..fine.len()).map(|k| k as f64).collect();
    let to_freq = |ip: f64| interp(ip, &axis, &fine.freqs);
    let (left, right) = match (widths.left_ips.first(), widths.right_ips.first()) {
        (Some(l), Some(r)) => (fr - to_freq(*l), to_freq(*r) - fr),
        _ => (0.0, 0.0),
    };
    let fwhm = left + right;
    let qr = if fwhm > 0.0 && fwhm.is_finite() {
        fr / fwhm
    } else {
        FALLBACK_QR
    };

    DipEstimate {
        index,
        fr,
        qr,
        min_mag: fine.z[index].norm(),
        left_half_width: left,
        right_half_width: right,
    }
}

/// Cable delay from the slope of the unwrapped phase, `phase = -2 pi f tau + c`.
///
/// Returns `None` with fewer than three points.
pub fn cable_delay(freqs: &[f64], z: &[Complex64]) -> Option<f64> {
    if freqs.len() < 3 {
        return None;
    }
    let phase = unwrap(&z.iter().map(|v| v.arg()).collect::<Vec<_>>());
    let line = Polynomial::fit(freqs, &phase, 1).ok()?;
    let tau = -line.derivative_at(freqs[0]) / (2.0 * PI);
    tau.is_finite().then_some(tau)
}

/// Off-resonance complex baseline: the delay-corrected mean of the gain
/// points, or the mean of the fine sweep's end points without gain data.
pub fn complex_baseline(gain: &SweepSlice, fine: &SweepSlice, f0: f64, tau: f64) -> Complex64 {
    let derotate = |f: f64, z: Complex64| z * Complex64::from_polar(1.0, 2.0 * PI * (f - f0) * tau);
    if gain.is_empty() {
        let n = fine.len();
        return (derotate(fine.freqs[0], fine.z[0]) + derotate(fine.freqs[n - 1], fine.z[n - 1])) / 2.0;
    }
    gain.freqs
        .iter()
        .zip(&gain.z)
        .map(|(f, z)| derotate(*f, *z))
        .sum::<Complex64>()
        / gain.len() as f64
}

/// Depth parameter `amp = 1 - min|S21| / |baseline|`, kept inside `[0.01, 0.99]`.
pub fn depth(min_mag: f64, baseline_mag: f64) -> f64 {
    if baseline_mag > 0.0 && baseline_mag.is_finite() {
        (1.0 - min_mag / baseline_mag).clamp(0.01, 0.99)
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resonator::bifurcation::{detuning, generator_detuning, transmission};
    use approx::assert_relative_eq;
    use kid_rs_core::num_rs::linspace;

    fn lorentzian(fr: f64, qr: f64, amp: f64) -> SweepSlice {
        let freqs = linspace(fr * (1.0 - 5.0 / qr), fr * (1.0 + 5.0 / qr), 401);
        let z = freqs
            .iter()
            .map(|f| transmission(detuning(generator_detuning(*f, fr, qr), 0.0), amp, 0.0))
            .collect();
        SweepSlice {
            freqs,
            z,
            std: None,
        }
    }

    #[test]
    fn dip_position_and_width_of_linear_resonator() {
        let fine = lorentzian(4.0e9, 2.0e4, 0.3);
        let dip = estimate_dip(&fine);
        assert_relative_eq!(dip.fr, 4.0e9, max_relative = 1e-7);
        assert_relative_eq!(dip.left_half_width, dip.right_half_width, max_relative = 0.02);
        // half depth of |S21|^2 sits at y = +-1/2
        assert_relative_eq!(dip.qr, 2.0e4, max_relative = 0.02);
        assert_relative_eq!(dip.min_mag, 0.7, epsilon = 1e-6);
    }

    #[test]
    fn flat_trace_falls_back_to_default_qr() {
        let fine = SweepSlice {
            freqs: vec![1.0, 2.0, 3.0],
            z: vec![Complex64::new(1.0, 0.0); 3],
            std: None,
        };
        assert_eq!(estimate_dip(&fine).qr, FALLBACK_QR);
    }

    #[test]
    fn cable_delay_from_phase_slope() {
        let tau = 35e-9;
        let freqs = linspace(3.9e9, 4.1e9, 2001);
        let z: Vec<Complex64> = freqs
            .iter()
            .map(|f| Complex64::from_polar(0.8, -2.0 * PI * f * tau + 0.4))
            .collect();
        assert_relative_eq!(cable_delay(&freqs, &z).expect("enough points"), tau, max_relative = 1e-6);
        assert!(cable_delay(&freqs[..2], &z[..2]).is_none());
    }

    #[test]
    fn depth_is_clamped() {
        assert_relative_eq!(depth(0.7, 1.0), 0.3, epsilon = 1e-12);
        assert_eq!(depth(0.0, 1.0), 0.99);
        assert_eq!(depth(2.0, 1.0), 0.01);
    }
}
