//! Least-squares circle fitting in the complex plane.

use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle, Read1D};
use crate::linalg::lm::{LeastSquaresProblem, LevenbergMarquardt, LevenbergMarquardtConfig};
use kid_rs_core::num_rs::lstsq;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A fitted circle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    /// Centre, real part.
    pub xc: f64,
    /// Centre, imaginary part.
    pub yc: f64,
    /// Radius.
    pub r: f64,
}

impl Circle {
    /// Centre as a complex number.
    pub fn centre(&self) -> Complex64 {
        Complex64::new(self.xc, self.yc)
    }

    /// RMS of the radial residuals `|p - c| - r`.
    pub fn residual_rms(&self, points: &[Complex64]) -> f64 {
        if points.is_empty() {
            return 0.0;
        }
        let c = self.centre();
        let ss: f64 = points.iter().map(|p| ((p - c).norm() - self.r).powi(2)).sum();
        (ss / points.len() as f64).sqrt()
    }
}

/// Constructor config for [`CircleFitKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleFitConfig {
    /// Refine the algebraic estimate by minimizing geometric distance.
    pub geometric: bool,
    /// Iteration cap for the geometric refinement.
    pub max_iterations: usize,
}

impl Default for CircleFitConfig {
    fn default() -> Self {
        Self {
            geometric: true,
            max_iterations: 200,
        }
    }
}

/// Algebraic (Kasa) circle fit with optional geometric refinement.
///
/// Points are centred on their mean before the algebraic solve.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::kernel::KernelLifecycle;
/// use kid_rs::linalg::{CircleFitConfig, CircleFitKernel};
/// use num_complex::Complex64;
///
/// let pts: Vec<Complex64> = (0..12)
///     .map(|k| Complex64::new(0.5, -0.2) + Complex64::from_polar(0.3, k as f64 * 0.4))
///     .collect();
/// let fit = CircleFitKernel::try_new(CircleFitConfig::default()).unwrap();
/// let circle = fit.run(&pts).unwrap();
/// assert_relative_eq!(circle.r, 0.3, max_relative = 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleFitKernel {
    geometric: bool,
    lm: LevenbergMarquardt,
}

impl KernelLifecycle for CircleFitKernel {
    type Config = CircleFitConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        let lm = LevenbergMarquardt::try_new(LevenbergMarquardtConfig {
            max_iterations: config.max_iterations,
            ..Default::default()
        })?;
        Ok(Self {
            geometric: config.geometric,
            lm,
        })
    }
}

struct GeometricCircle<'a> {
    points: &'a [Complex64],
    scale: f64,
}

impl LeastSquaresProblem for GeometricCircle<'_> {
    fn n_params(&self) -> usize {
        3
    }

    fn n_residuals(&self) -> usize {
        self.points.len()
    }

    fn residuals(&self, p: &[f64], out: &mut [f64]) {
        let c = Complex64::new(p[0], p[1]);
        for (o, z) in out.iter_mut().zip(self.points) {
            *o = (z - c).norm() - p[2];
        }
    }

    fn typical_scale(&self, _j: usize) -> f64 {
        self.scale
    }
}

fn kasa(points: &[Complex64], mean: Complex64) -> Result<Circle, ExecInvariantViolation> {
    let n = points.len();
    let a = DMatrix::from_fn(n, 3, |i, j| {
        let d = points[i] - mean;
        match j {
            0 => d.re,
            1 => d.im,
            _ => 1.0,
        }
    });
    let b = DVector::from_iterator(n, points.iter().map(|z| -(z - mean).norm_sqr()));
    let sol = lstsq(&a, &b)?;
    let (cx, cy) = (-sol[0] / 2.0, -sol[1] / 2.0);
    let r2 = cx * cx + cy * cy - sol[2];
    if !(r2.is_finite() && r2 > 0.0) {
        return Err(ExecInvariantViolation::InvalidState {
            reason: "algebraic circle fit produced a non-positive radius",
        });
    }
    Ok(Circle {
        xc: mean.re + cx,
        yc: mean.im + cy,
        r: r2.sqrt(),
    })
}

impl CircleFitKernel {
    /// Fit a circle through `points`. Needs at least three non-collinear points.
    pub fn run<I>(&self, points: &I) -> Result<Circle, ExecInvariantViolation>
    where
        I: Read1D<Complex64> + ?Sized,
    {
        let points = points.read_slice()?;
        if points.len() < 3 {
            return Err(ExecInvariantViolation::LengthMismatch {
                arg: "points",
                expected: 3,
                got: points.len(),
            });
        }
        if points.iter().any(|z| !(z.re.is_finite() && z.im.is_finite())) {
            return Err(ExecInvariantViolation::InvalidState {
                reason: "circle points must be finite",
            });
        }
        let mean = points.iter().sum::<Complex64>() / points.len() as f64;
        let algebraic = kasa(points, mean)?;
        if !self.geometric {
            return Ok(algebraic);
        }

        let problem = GeometricCircle {
            points,
            scale: algebraic.r,
        };
        match self
            .lm
            .solve(&problem, &[algebraic.xc, algebraic.yc, algebraic.r])
        {
            Ok(report) if report.params[2] > 0.0 => Ok(Circle {
                xc: report.params[0],
                yc: report.params[1],
                r: report.params[2],
            }),
            Ok(_) => Ok(algebraic),
            Err(err) => {
                debug!(%err, "geometric circle refinement failed, keeping algebraic fit");
                Ok(algebraic)
            }
        }
    }
}
