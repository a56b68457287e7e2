//! Bounded, weighted Levenberg-Marquardt least squares.

use crate::kernel::{ConfigError, KernelLifecycle};
use nalgebra::{DMatrix, DVector};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// A nonlinear least-squares problem `min sum r_i(p)^2`.
///
/// Implementors fold any per-point weights into the residuals.
pub trait LeastSquaresProblem {
    /// Number of free parameters.
    fn n_params(&self) -> usize;

    /// Number of residuals produced per evaluation.
    fn n_residuals(&self) -> usize;

    /// Evaluate the residual vector at `params` into `out`.
    fn residuals(&self, params: &[f64], out: &mut [f64]);

    /// Lower and upper parameter bounds. Unbounded by default.
    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.n_params();
        (vec![f64::NEG_INFINITY; n], vec![f64::INFINITY; n])
    }

    /// Lower limit on the magnitude used for the finite-difference step of
    /// parameter `j`.
    fn typical_scale(&self, _j: usize) -> f64 {
        1.0
    }
}

/// Constructor config for [`LevenbergMarquardt`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtConfig {
    /// Maximum number of accepted or rejected outer iterations.
    pub max_iterations: usize,
    /// Relative cost reduction below which the fit is converged.
    pub ftol: f64,
    /// Relative parameter step below which the fit is converged.
    pub xtol: f64,
    /// Infinity norm of the scaled gradient below which the fit is converged.
    pub gtol: f64,
    /// Relative central-difference step.
    pub diff_step: f64,
    /// Wall-clock budget for one solve.
    pub timeout: Option<Duration>,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            diff_step: 1e-7,
            timeout: None,
        }
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Relative cost reduction fell below `ftol`.
    CostTolerance,
    /// Relative parameter step fell below `xtol`.
    StepTolerance,
    /// Scaled gradient fell below `gtol`.
    GradientTolerance,
    /// Residuals are exactly zero.
    ExactFit,
    /// Damping saturated without finding a better point.
    NoImprovement,
}

/// Solver failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LmError {
    /// Residuals were not finite at the starting point.
    #[error("residuals are not finite at the initial parameters")]
    NonFinite,
    /// The iteration cap was reached before any convergence test passed.
    #[error("no convergence after {iterations} iterations")]
    MaxIterations {
        /// Iterations performed.
        iterations: usize,
    },
    /// The wall-clock budget expired.
    #[error("deadline exceeded after {iterations} iterations")]
    Timeout {
        /// Iterations performed.
        iterations: usize,
    },
    /// Starting vector length did not match the problem.
    #[error("expected {expected} parameters, got {got}")]
    ParamCount {
        /// Problem parameter count.
        expected: usize,
        /// Provided parameter count.
        got: usize,
    },
    /// Fewer residuals than parameters.
    #[error("{residuals} residuals cannot constrain {params} parameters")]
    Underdetermined {
        /// Residual count.
        residuals: usize,
        /// Parameter count.
        params: usize,
    },
}

/// Converged solution.
#[derive(Debug, Clone, PartialEq)]
pub struct LmReport {
    /// Best parameters.
    pub params: Vec<f64>,
    /// Residuals at `params`.
    pub residuals: Vec<f64>,
    /// `sum r_i^2` at `params`.
    pub cost: f64,
    /// Outer iterations performed.
    pub iterations: usize,
    /// Convergence reason.
    pub termination: Termination,
}

/// Levenberg-Marquardt solver kernel.
///
/// Uses Marquardt's diagonal scaling of `J^T J`, central-difference
/// Jacobians and box bounds enforced by clamping each trial point.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::kernel::KernelLifecycle;
/// use kid_rs::linalg::{LeastSquaresProblem, LevenbergMarquardt, LevenbergMarquardtConfig};
///
/// // y = p0 * exp(p1 * x)
/// struct Exp { x: Vec<f64>, y: Vec<f64> }
/// impl LeastSquaresProblem for Exp {
///     fn n_params(&self) -> usize { 2 }
///     fn n_residuals(&self) -> usize { self.x.len() }
///     fn residuals(&self, p: &[f64], out: &mut [f64]) {
///         for ((o, x), y) in out.iter_mut().zip(&self.x).zip(&self.y) {
///             *o = p[0] * (p[1] * x).exp() - y;
///         }
///     }
/// }
/// let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
/// let y = x.iter().map(|x| 2.5 * (-1.3 * x).exp()).collect();
/// let lm = LevenbergMarquardt::try_new(LevenbergMarquardtConfig::default()).unwrap();
/// let report = lm.solve(&Exp { x, y }, &[1.0, 0.0]).unwrap();
/// assert_relative_eq!(report.params[0], 2.5, epsilon = 1e-8);
/// assert_relative_eq!(report.params[1], -1.3, epsilon = 1e-8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
}

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;

impl KernelLifecycle for LevenbergMarquardt {
    type Config = LevenbergMarquardtConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if config.max_iterations == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "max_iterations",
                reason: "max_iterations must be > 0",
            });
        }
        for (arg, v) in [
            ("ftol", config.ftol),
            ("xtol", config.xtol),
            ("gtol", config.gtol),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(ConfigError::InvalidArgument {
                    arg,
                    reason: "tolerances must be finite and >= 0",
                });
            }
        }
        if !(config.diff_step.is_finite() && config.diff_step > 0.0) {
            return Err(ConfigError::InvalidArgument {
                arg: "diff_step",
                reason: "diff_step must be finite and > 0",
            });
        }
        Ok(Self { config })
    }
}

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

fn clamp_into(p: &mut [f64], lower: &[f64], upper: &[f64]) {
    for ((v, lo), hi) in p.iter_mut().zip(lower).zip(upper) {
        *v = v.clamp(*lo, *hi);
    }
}

impl LevenbergMarquardt {
    /// Solver configuration.
    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    fn jacobian<P>(&self, problem: &P, p: &[f64], m: usize) -> DMatrix<f64>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let n = p.len();
        let mut jac = DMatrix::<f64>::zeros(m, n);
        let mut work = p.to_vec();
        let mut r_hi = vec![0.0; m];
        let mut r_lo = vec![0.0; m];
        for j in 0..n {
            let base = p[j].abs().max(problem.typical_scale(j).abs());
            let h = self.config.diff_step * base.max(f64::MIN_POSITIVE);
            work[j] = p[j] + h;
            problem.residuals(&work, &mut r_hi);
            work[j] = p[j] - h;
            problem.residuals(&work, &mut r_lo);
            work[j] = p[j];
            for i in 0..m {
                jac[(i, j)] = (r_hi[i] - r_lo[i]) / (2.0 * h);
            }
        }
        jac
    }

    /// Minimize `problem` starting from `p0`.
    pub fn solve<P>(&self, problem: &P, p0: &[f64]) -> Result<LmReport, LmError>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let n = problem.n_params();
        let m = problem.n_residuals();
        if p0.len() != n {
            return Err(LmError::ParamCount {
                expected: n,
                got: p0.len(),
            });
        }
        if m < n {
            return Err(LmError::Underdetermined {
                residuals: m,
                params: n,
            });
        }
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        let (lower, upper) = problem.bounds();
        let mut p = p0.to_vec();
        clamp_into(&mut p, &lower, &upper);
        let mut r = vec![0.0; m];
        problem.residuals(&p, &mut r);
        let mut cost = sum_sq(&r);
        if !cost.is_finite() {
            return Err(LmError::NonFinite);
        }

        let mut lambda = LAMBDA_INIT;
        let mut trial = vec![0.0; n];
        let mut r_trial = vec![0.0; m];
        let finish = |p: Vec<f64>, r: Vec<f64>, cost: f64, iterations, termination| {
            debug!(iterations, cost, ?termination, "levenberg-marquardt converged");
            Ok(LmReport {
                params: p,
                residuals: r,
                cost,
                iterations,
                termination,
            })
        };

        for iteration in 1..=self.config.max_iterations {
            if cost == 0.0 {
                return finish(p, r, cost, iteration - 1, Termination::ExactFit);
            }
            if expired() {
                return Err(LmError::Timeout {
                    iterations: iteration - 1,
                });
            }

            let jac = self.jacobian(problem, &p, m);
            let jtj = jac.tr_mul(&jac);
            let grad = jac.tr_mul(&DVector::from_column_slice(&r));
            let diag: Vec<f64> = (0..n)
                .map(|j| if jtj[(j, j)] > 0.0 { jtj[(j, j)] } else { 1.0 })
                .collect();

            let scaled_grad = (0..n)
                .map(|j| grad[j].abs() / (diag[j].sqrt() * cost.sqrt()))
                .fold(0.0, f64::max);
            if scaled_grad <= self.config.gtol {
                return finish(p, r, cost, iteration, Termination::GradientTolerance);
            }

            loop {
                if expired() {
                    return Err(LmError::Timeout {
                        iterations: iteration,
                    });
                }
                let mut lhs = jtj.clone();
                for (j, d) in diag.iter().enumerate() {
                    lhs[(j, j)] += lambda * d;
                }
                let step = lhs.cholesky().map(|c| c.solve(&(-&grad)));
                let Some(step) = step else {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        return finish(p, r, cost, iteration, Termination::NoImprovement);
                    }
                    continue;
                };

                for j in 0..n {
                    trial[j] = p[j] + step[j];
                }
                clamp_into(&mut trial, &lower, &upper);
                problem.residuals(&trial, &mut r_trial);
                let trial_cost = sum_sq(&r_trial);

                if trial_cost.is_finite() && trial_cost < cost {
                    let reduction = (cost - trial_cost) / cost;
                    let step_norm = trial
                        .iter()
                        .zip(&p)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt();
                    let p_norm = p.iter().map(|v| v * v).sum::<f64>().sqrt();
                    core::mem::swap(&mut p, &mut trial);
                    core::mem::swap(&mut r, &mut r_trial);
                    cost = trial_cost;
                    lambda = (lambda / 10.0).max(1e-15);

                    if reduction <= self.config.ftol {
                        return finish(p, r, cost, iteration, Termination::CostTolerance);
                    }
                    if step_norm <= self.config.xtol * (p_norm + self.config.xtol) {
                        return finish(p, r, cost, iteration, Termination::StepTolerance);
                    }
                    break;
                }

                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    return finish(p, r, cost, iteration, Termination::NoImprovement);
                }
            }
        }

        Err(LmError::MaxIterations {
            iterations: self.config.max_iterations,
        })
    }
}
