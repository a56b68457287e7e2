//! Generator detuning of a nonlinear kinetic-inductance resonator.
//!
//! The detuning `y` solves `4y^3 - 4 y0 y^2 + y - (y0 + a) = 0` with
//! `y0 = Qr (f - fr) / fr`. Past bifurcation (`a > 4 sqrt(3) / 9`) three real
//! roots can exist; the upward-sweep branch is the smallest.

use core::f64::consts::PI;
use num_complex::Complex64;

const NEWTON_STEPS: usize = 2;

fn cubic(y: f64, y0: f64, a: f64) -> f64 {
    4.0 * y * y * y - 4.0 * y0 * y * y + y - (y0 + a)
}

fn cubic_prime(y: f64, y0: f64) -> f64 {
    12.0 * y * y - 8.0 * y0 * y + 1.0
}

/// Unitless generator detuning `y0 = Qr (f - fr) / fr`.
#[inline]
pub fn generator_detuning(f: f64, fr: f64, qr: f64) -> f64 {
    qr * (f - fr) / fr
}

/// Resonator detuning for generator detuning `y0` and nonlinearity `a`.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::resonator::bifurcation::detuning;
///
/// // linear resonator: y == y0
/// assert_relative_eq!(detuning(0.37, 0.0), 0.37, epsilon = 1e-12);
/// ```
pub fn detuning(y0: f64, a: f64) -> f64 {
    // y = t + y0/3 turns the monic cubic into t^3 + p t + q = 0
    let p = 0.25 - y0 * y0 / 3.0;
    let q = -2.0 * y0.powi(3) / 27.0 + y0 / 12.0 - (y0 + a) / 4.0;
    let disc = (q / 2.0).powi(2) + (p / 3.0).powi(3);

    let t = if disc > 0.0 {
        let s = disc.sqrt();
        (-q / 2.0 + s).cbrt() + (-q / 2.0 - s).cbrt()
    } else if p < 0.0 {
        let m = 2.0 * (-p / 3.0).sqrt();
        let arg = (3.0 * q / (p * m)).clamp(-1.0, 1.0);
        let theta = arg.acos() / 3.0;
        (0..3)
            .map(|k| m * (theta - 2.0 * PI * k as f64 / 3.0).cos())
            .fold(f64::INFINITY, f64::min)
    } else {
        (-q).cbrt()
    };

    let mut y = t + y0 / 3.0;
    for _ in 0..NEWTON_STEPS {
        let d = cubic_prime(y, y0);
        if d == 0.0 {
            break;
        }
        let step = cubic(y, y0, a) / d;
        if !step.is_finite() || step.abs() > 1e-3 * (1.0 + y.abs()) {
            break;
        }
        y -= step;
    }
    y
}

/// Normalized resonator transmission for detuning `y`:
/// `1 - amp e^{j phi} / (1 + 2jy) + amp/2 (e^{j phi} - 1)`.
#[inline]
pub fn transmission(y: f64, amp: f64, phi: f64) -> Complex64 {
    let rot = Complex64::from_polar(1.0, phi);
    Complex64::new(1.0, 0.0) - amp * rot / Complex64::new(1.0, 2.0 * y)
        + amp / 2.0 * (rot - 1.0)
}
