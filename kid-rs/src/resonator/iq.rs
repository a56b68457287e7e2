use super::bifurcation::{detuning, generator_detuning, transmission};
use super::guess::{cable_delay, complex_baseline, depth, DipEstimate};
use super::window::ChannelWindow;
use super::{ModelKind, ResonatorModel, A, AMP, FR, PHI, QR};
use core::f64::consts::PI;
use num_complex::Complex64;

const I0: usize = 5;
const Q0: usize = 6;
const TAU: usize = 7;

/// `S21 = (i0 + j q0) e^{-j 2 pi (f - f0) tau} S(y)`, fit to I and Q jointly.
///
/// Parameters `[fr, Qr, amp, phi, a, i0, q0, tau]`; the reference frequency
/// is `f0`. Residuals interleave real and imaginary parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IqModel;

const NAMES: [&str; 8] = ["fr", "Qr", "amp", "phi", "a", "i0", "q0", "tau"];

impl ResonatorModel for IqModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Iq
    }

    fn param_names(&self) -> &'static [&'static str] {
        &NAMES
    }

    fn observables_per_point(&self) -> usize {
        2
    }

    fn response(&self, p: &[f64], f0: f64, f: f64) -> Complex64 {
        let y = detuning(generator_detuning(f, p[FR], p[QR]), p[A]);
        Complex64::new(p[I0], p[Q0])
            * Complex64::from_polar(1.0, -2.0 * PI * (f - f0) * p[TAU])
            * transmission(y, p[AMP], p[PHI])
    }

    fn observe(&self, z: Complex64, out: &mut [f64]) {
        out[0] = z.re;
        out[1] = z.im;
    }

    fn sigma(&self, _z: Complex64, std: Option<(f64, f64)>, out: &mut [f64]) {
        let (si, sq) = std.unwrap_or((1.0, 1.0));
        out[0] = si;
        out[1] = sq;
    }

    fn initial_guess(&self, window: &ChannelWindow, dip: &DipEstimate) -> (Vec<f64>, f64) {
        let f0 = dip.fr;
        let tau = cable_delay(&window.gain.freqs, &window.gain.z).unwrap_or(0.0);
        let c = complex_baseline(&window.gain, &window.fine, f0, tau);
        let amp = depth(dip.min_mag, c.norm());
        (vec![dip.fr, dip.qr, amp, 0.0, 0.0, c.re, c.im, tau], f0)
    }

    fn bounds(&self, window: &ChannelWindow, _guess: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (f_lo, f_hi) = super::fine_range(window);
        let mut lower = vec![f64::NEG_INFINITY; NAMES.len()];
        let mut upper = vec![f64::INFINITY; NAMES.len()];
        lower[..5].copy_from_slice(&[f_lo, 10.0, 1e-4, -PI, 0.0]);
        upper[..5].copy_from_slice(&[f_hi, 1e8, 1.0, PI, 5.0]);
        (lower, upper)
    }

    fn typical_scales(&self, _window: &ChannelWindow, guess: &[f64]) -> Vec<f64> {
        let gain = Complex64::new(guess[I0], guess[Q0]).norm().max(1e-12);
        vec![guess[FR], guess[QR], 0.1, 0.1, 0.1, gain, gain, 1e-9]
    }

    fn needs_gain_baseline(&self) -> bool {
        true
    }
}
