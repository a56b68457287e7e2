use super::bifurcation::{detuning, generator_detuning, transmission};
use super::guess::{depth, DipEstimate};
use super::window::ChannelWindow;
use super::{ModelKind, ResonatorModel, A, AMP, FR, PHI, QR};
use core::f64::consts::PI;
use num_complex::Complex64;

const B0: usize = 5;
const B1: usize = 6;

/// `|S21|^2 = (b0 + b1 xlin) |S(y)|^2` with `xlin = (f - flin) / flin`.
///
/// Parameters `[fr, Qr, amp, phi, a, b0, b1]`; the reference frequency is
/// `flin`. Weights come from `sigma^2 = (2 I sI)^2 + (2 Q sQ)^2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagnitudeModel;

const NAMES: [&str; 7] = ["fr", "Qr", "amp", "phi", "a", "b0", "b1"];

impl ResonatorModel for MagnitudeModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Magnitude
    }

    fn param_names(&self) -> &'static [&'static str] {
        &NAMES
    }

    fn observables_per_point(&self) -> usize {
        1
    }

    fn response(&self, p: &[f64], flin: f64, f: f64) -> Complex64 {
        let xlin = (f - flin) / flin;
        let gain = (p[B0] + p[B1] * xlin).max(0.0).sqrt();
        let y = detuning(generator_detuning(f, p[FR], p[QR]), p[A]);
        gain * transmission(y, p[AMP], p[PHI])
    }

    fn observe(&self, z: Complex64, out: &mut [f64]) {
        out[0] = z.norm_sqr();
    }

    fn sigma(&self, z: Complex64, std: Option<(f64, f64)>, out: &mut [f64]) {
        out[0] = match std {
            Some((si, sq)) => ((2.0 * z.re * si).powi(2) + (2.0 * z.im * sq).powi(2)).sqrt(),
            None => 1.0,
        };
    }

    fn initial_guess(&self, window: &ChannelWindow, dip: &DipEstimate) -> (Vec<f64>, f64) {
        let baseline: Vec<f64> = if window.gain.is_empty() {
            let fine = &window.fine.z;
            vec![fine[0].norm_sqr(), fine[fine.len() - 1].norm_sqr()]
        } else {
            window.gain.z.iter().map(|z| z.norm_sqr()).collect()
        };
        let b0 = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let amp = depth(dip.min_mag, b0.sqrt());
        (vec![dip.fr, dip.qr, amp, 0.0, 0.0, b0, 0.0], dip.fr)
    }

    fn bounds(&self, window: &ChannelWindow, _guess: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (f_lo, f_hi) = super::fine_range(window);
        (
            vec![f_lo, 10.0, 1e-4, -PI, 0.0, 0.0, f64::NEG_INFINITY],
            vec![f_hi, 1e8, 1.0, PI, 5.0, f64::INFINITY, f64::INFINITY],
        )
    }

    fn typical_scales(&self, window: &ChannelWindow, guess: &[f64]) -> Vec<f64> {
        let flin = guess[FR];
        let xspan = window
            .fine
            .freqs
            .iter()
            .chain(&window.gain.freqs)
            .map(|f| ((f - flin) / flin).abs())
            .fold(0.0, f64::max)
            .max(1e-9);
        vec![flin, guess[QR], 0.1, 0.1, 0.1, guess[B0].abs().max(1e-12), guess[B0].abs().max(1e-12) / xspan]
    }
}
