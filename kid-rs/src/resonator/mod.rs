//! Nonlinear resonator models and the per-channel resonance fitter.
//!
//! Two interchangeable models sit behind [`ResonatorModel`]; [`ModelKind`]
//! selects one per call:
//!
//! - [`MagnitudeModel`] fits `|S21|^2` with a linear baseline.
//! - [`IqModel`] fits the complex `S21` with a complex gain and cable delay.
//!
//! Both share the bifurcation detuning in [`bifurcation`].

pub mod bifurcation;
pub mod guess;
mod iq;
mod magnitude;
pub mod window;

pub use iq::IqModel;
pub use magnitude::MagnitudeModel;

use crate::error::FitError;
use crate::kernel::{ConfigError, KernelLifecycle};
use crate::linalg::{LeastSquaresProblem, LevenbergMarquardt, LevenbergMarquardtConfig};
use guess::{estimate_dip, DipEstimate, NONLINEARITY_SCAN};
use kid_rs_core::num_rs::{linspace, Polynomial};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use window::ChannelWindow;

pub(crate) const FR: usize = 0;
pub(crate) const QR: usize = 1;
pub(crate) const AMP: usize = 2;
pub(crate) const PHI: usize = 3;
pub(crate) const A: usize = 4;

/// Resonator model selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Magnitude-only model fit to `|S21|^2`.
    #[default]
    Magnitude,
    /// Complex model fit to I and Q.
    Iq,
}

impl ModelKind {
    /// The model implementation for this kind.
    pub fn model(self) -> &'static dyn ResonatorModel {
        match self {
            ModelKind::Magnitude => &MagnitudeModel,
            ModelKind::Iq => &IqModel,
        }
    }
}

/// A resonator transmission model.
///
/// The first five parameters of every model are `[fr, Qr, amp, phi, a]`.
pub trait ResonatorModel: Send + Sync {
    /// Selector of this model.
    fn kind(&self) -> ModelKind;

    /// Parameter names in vector order.
    fn param_names(&self) -> &'static [&'static str];

    /// Parameter count.
    fn n_params(&self) -> usize {
        self.param_names().len()
    }

    /// Observables contributed by each sweep point.
    fn observables_per_point(&self) -> usize;

    /// Complex model response at `f` for `params` and the reference frequency.
    fn response(&self, params: &[f64], reference: f64, f: f64) -> Complex64;

    /// Map a complex sample onto the fitted observables.
    fn observe(&self, z: Complex64, out: &mut [f64]);

    /// One-sigma uncertainty of each observable; unit weights without `std`.
    fn sigma(&self, z: Complex64, std: Option<(f64, f64)>, out: &mut [f64]);

    /// Initial parameters (with `a = 0`) and the reference frequency.
    fn initial_guess(&self, window: &ChannelWindow, dip: &DipEstimate) -> (Vec<f64>, f64);

    /// Parameter box bounds.
    fn bounds(&self, window: &ChannelWindow, guess: &[f64]) -> (Vec<f64>, Vec<f64>);

    /// Typical parameter magnitudes, used to size finite-difference steps.
    fn typical_scales(&self, window: &ChannelWindow, guess: &[f64]) -> Vec<f64>;

    /// `true` when the model has no amplitude baseline of its own and the
    /// sweeps must be divided by the fitted `|gain|` trend first.
    fn needs_gain_baseline(&self) -> bool {
        false
    }
}

pub(crate) fn fine_range(window: &ChannelWindow) -> (f64, f64) {
    let freqs = &window.fine.freqs;
    (freqs[0], freqs[freqs.len() - 1])
}

const BASELINE_DEGREE: usize = 1;

/// Linear `|gain|` trend over the off-resonance gain points, if it is
/// positive across the whole window.
fn gain_baseline(window: &ChannelWindow) -> Option<Polynomial> {
    let gain = &window.gain;
    if gain.len() < BASELINE_DEGREE + 2 {
        return None;
    }
    let mags: Vec<f64> = gain.z.iter().map(|z| z.norm()).collect();
    let poly = Polynomial::fit(&gain.freqs, &mags, BASELINE_DEGREE).ok()?;
    let (f_lo, f_hi) = fine_range(window);
    let edges = [f_lo, f_hi, gain.freqs[0], gain.freqs[gain.len() - 1]];
    edges
        .iter()
        .all(|f| {
            let g = poly.eval(*f);
            g.is_finite() && g > 0.0
        })
        .then_some(poly)
}

/// Outcome of one channel's resonator fit. A failed fit is the zero vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Model used.
    pub model: ModelKind,
    /// Best-fit parameters.
    pub params: Vec<f64>,
    /// `flin` (magnitude model) or `f0` (IQ model).
    pub reference_freq: f64,
    /// Initial parameters handed to the solver.
    pub guess: Vec<f64>,
    /// `sum(r^2 / sigma^2) / (m - n)`.
    pub reduced_chi_squared: f64,
    /// Solver iterations.
    pub iterations: usize,
    /// `(left, right)` half widths of the dip at half depth, Hz.
    pub half_widths: (f64, f64),
    /// Dense frequency grid spanning the fine window.
    pub curve_freqs: Vec<f64>,
    /// Model response on `curve_freqs`.
    pub model_curve: Vec<Complex64>,
    /// Initial-guess response on `curve_freqs`.
    pub guess_curve: Vec<Complex64>,
    /// Internal quality factor.
    pub qi: f64,
    /// Coupling quality factor `Qr / amp`.
    pub qc: f64,
    /// `|gain|` trend divided out before fitting; `i0`, `q0` and the
    /// curves before re-scaling are relative to it.
    pub gain_baseline: Option<Polynomial>,
}

impl FitResult {
    /// The zero-vector result reported for a failed channel.
    pub fn failed(model: ModelKind) -> Self {
        let n = model.model().n_params();
        Self {
            model,
            params: vec![0.0; n],
            reference_freq: 0.0,
            guess: vec![0.0; n],
            reduced_chi_squared: 0.0,
            iterations: 0,
            half_widths: (0.0, 0.0),
            curve_freqs: Vec::new(),
            model_curve: Vec::new(),
            guess_curve: Vec::new(),
            qi: 0.0,
            qc: 0.0,
            gain_baseline: None,
        }
    }

    /// `true` for the zero-vector failure result.
    pub fn is_failed(&self) -> bool {
        self.params.iter().all(|p| *p == 0.0)
    }

    /// Parameter by name.
    pub fn param(&self, name: &str) -> Option<f64> {
        let idx = self.model.model().param_names().iter().position(|n| *n == name)?;
        self.params.get(idx).copied()
    }

    /// Resonance frequency.
    pub fn fr(&self) -> f64 {
        self.params[FR]
    }

    /// Loaded quality factor.
    pub fn qr(&self) -> f64 {
        self.params[QR]
    }

    /// Dip depth.
    pub fn amp(&self) -> f64 {
        self.params[AMP]
    }

    /// Impedance-mismatch rotation.
    pub fn phi(&self) -> f64 {
        self.params[PHI]
    }

    /// Nonlinearity.
    pub fn nonlinearity(&self) -> f64 {
        self.params[A]
    }
}

/// `(Qi, Qc)` from `Qc = Qr / amp` and `1/Qi = 1/Qr - 1/Qc`. `Qi` is infinite
/// when the coupling dominates completely.
pub fn quality_factors(qr: f64, amp: f64) -> (f64, f64) {
    let qc = qr / amp;
    let inv_qi = 1.0 / qr - 1.0 / qc;
    let qi = if inv_qi > 0.0 { 1.0 / inv_qi } else { f64::INFINITY };
    (qi, qc)
}

/// Constructor config for [`ResonanceFitter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResonanceFitterConfig {
    /// Model to fit.
    pub model: ModelKind,
    /// Solver iteration cap.
    pub max_iterations: usize,
    /// Per-fit wall-clock budget.
    pub timeout: Option<Duration>,
    /// Points in the diagnostic curves.
    pub curve_points: usize,
}

impl Default for ResonanceFitterConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Magnitude,
            max_iterations: 1000,
            timeout: None,
            curve_points: 500,
        }
    }
}

/// Weighted least-squares resonator fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResonanceFitter {
    model: ModelKind,
    lm: LevenbergMarquardt,
    curve_points: usize,
}

impl KernelLifecycle for ResonanceFitter {
    type Config = ResonanceFitterConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if config.curve_points < 2 {
            return Err(ConfigError::InvalidArgument {
                arg: "curve_points",
                reason: "curve_points must be >= 2",
            });
        }
        let lm = LevenbergMarquardt::try_new(LevenbergMarquardtConfig {
            max_iterations: config.max_iterations,
            timeout: config.timeout,
            ..Default::default()
        })?;
        Ok(Self {
            model: config.model,
            lm,
            curve_points: config.curve_points,
        })
    }
}

struct SweepProblem<'a> {
    model: &'a dyn ResonatorModel,
    reference: f64,
    freqs: Vec<f64>,
    observed: Vec<f64>,
    sigma: Vec<f64>,
    bounds: (Vec<f64>, Vec<f64>),
    scales: Vec<f64>,
}

impl<'a> SweepProblem<'a> {
    fn new(model: &'a dyn ResonatorModel, window: &ChannelWindow, guess: &[f64], reference: f64) -> Self {
        let per = model.observables_per_point();
        let fine = &window.fine;
        let gain = &window.gain;
        let use_std = fine.std.is_some() && (gain.is_empty() || gain.std.is_some());

        let mut freqs = Vec::with_capacity(fine.len() + gain.len());
        let mut observed = Vec::with_capacity(per * freqs.capacity());
        let mut sigma = Vec::with_capacity(per * freqs.capacity());
        let mut buf = vec![0.0; per];
        for slice in [fine, gain] {
            for (k, (f, z)) in slice.freqs.iter().zip(&slice.z).enumerate() {
                freqs.push(*f);
                model.observe(*z, &mut buf);
                observed.extend_from_slice(&buf);
                let std = if use_std {
                    slice.std.as_ref().map(|s| s[k])
                } else {
                    None
                };
                model.sigma(*z, std, &mut buf);
                sigma.extend_from_slice(&buf);
            }
        }

        // zero or missing sigma would blow up the weights
        let floor = sigma
            .iter()
            .copied()
            .filter(|s| s.is_finite() && *s > 0.0)
            .fold(f64::INFINITY, f64::min);
        let floor = if floor.is_finite() { floor } else { 1.0 };
        for s in sigma.iter_mut() {
            if !(s.is_finite() && *s > 0.0) {
                *s = floor;
            }
        }

        Self {
            model,
            reference,
            freqs,
            observed,
            sigma,
            bounds: model.bounds(window, guess),
            scales: model.typical_scales(window, guess),
        }
    }

    fn cost(&self, params: &[f64]) -> f64 {
        let mut r = vec![0.0; self.n_residuals()];
        self.residuals(params, &mut r);
        r.iter().map(|v| v * v).sum()
    }
}

impl LeastSquaresProblem for SweepProblem<'_> {
    fn n_params(&self) -> usize {
        self.model.n_params()
    }

    fn n_residuals(&self) -> usize {
        self.observed.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) {
        let per = self.model.observables_per_point();
        let mut buf = [0.0; 2];
        for (k, f) in self.freqs.iter().enumerate() {
            let z = self.model.response(params, self.reference, *f);
            self.model.observe(z, &mut buf[..per]);
            for i in 0..per {
                let idx = k * per + i;
                out[idx] = (buf[i] - self.observed[idx]) / self.sigma[idx];
            }
        }
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.bounds.clone()
    }

    fn typical_scale(&self, j: usize) -> f64 {
        self.scales[j]
    }
}

impl ResonanceFitter {
    /// Model implementation in use.
    pub fn model(&self) -> &'static dyn ResonatorModel {
        self.model.model()
    }

    /// Model selector in use.
    pub fn kind(&self) -> ModelKind {
        self.model
    }

    /// Minimum windowed points for a fit, `n_params + 1`.
    pub fn min_points(&self) -> usize {
        self.model().n_params() + 1
    }

    /// Fit one channel's windowed data.
    pub fn fit(&self, window: &ChannelWindow) -> Result<FitResult, FitError> {
        let model = self.model();
        let usable = window.fine.len() + window.gain.len();
        if usable < self.min_points() || window.fine.len() < 3 {
            return Err(FitError::Windowing {
                channel: window.channel,
                usable,
                required: self.min_points().max(3),
            });
        }

        let baseline = if model.needs_gain_baseline() {
            gain_baseline(window)
        } else {
            None
        };
        let normalized;
        let window = match &baseline {
            Some(poly) => {
                normalized = window.scaled(|f| poly.eval(f));
                &normalized
            }
            None => window,
        };
        let trend = |f: f64| baseline.as_ref().map_or(1.0, |poly| poly.eval(f));

        let dip = estimate_dip(&window.fine);
        let (mut guess, reference) = model.initial_guess(window, &dip);
        let problem = SweepProblem::new(model, window, &guess, reference);

        // coarse nonlinearity scan on the initial cost
        let (best_a, _) = NONLINEARITY_SCAN
            .iter()
            .map(|&a| {
                guess[A] = a;
                (a, problem.cost(&guess))
            })
            .filter(|(_, c)| c.is_finite())
            .fold((0.0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best });
        guess[A] = best_a;

        let report = self.lm.solve(&problem, &guess)?;
        let dof = problem.n_residuals() - problem.n_params();
        let reduced_chi_squared = report.cost / dof as f64;
        let params = report.params;

        let (f_lo, f_hi) = fine_range(window);
        let curve_freqs = linspace(f_lo, f_hi, self.curve_points);
        let curve = |p: &[f64]| -> Vec<Complex64> {
            curve_freqs
                .iter()
                .map(|f| model.response(p, reference, *f) * trend(*f))
                .collect()
        };
        let model_curve = curve(&params);
        let guess_curve = curve(&guess);
        let (qi, qc) = quality_factors(params[QR], params[AMP]);

        debug!(
            channel = window.channel,
            model = ?self.model,
            fr = params[FR],
            qr = params[QR],
            reduced_chi_squared,
            iterations = report.iterations,
            "resonator fit converged"
        );

        Ok(FitResult {
            model: self.model,
            params,
            reference_freq: reference,
            guess,
            reduced_chi_squared,
            iterations: report.iterations,
            half_widths: (dip.left_half_width, dip.right_half_width),
            curve_freqs,
            model_curve,
            guess_curve,
            qi,
            qc,
            gain_baseline: baseline,
        })
    }
}
