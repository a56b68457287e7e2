use super::lstsq;
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// A least-squares polynomial in a centred and scaled abscissa.
///
/// Readout frequencies sit around 1e9 Hz, so a raw Vandermonde matrix is
/// hopelessly conditioned. The fit is carried out in `u = (x - offset) / scale`
/// with `offset` the mean of the fitted abscissae and `scale` their largest
/// absolute deviation, which keeps `|u| <= 1` over the fitted range.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs_core::num_rs::Polynomial;
///
/// let x: Vec<f64> = (0..20).map(|i| 4.0e9 + 1.0e5 * i as f64).collect();
/// let y: Vec<f64> = x.iter().map(|f| 0.5 + 2.0e-7 * (f - 4.0e9)).collect();
/// let p = Polynomial::fit(&x, &y, 1).unwrap();
/// assert_relative_eq!(p.eval(4.0005e9), 0.5 + 2.0e-7 * 5.0e5, epsilon = 1e-9);
/// assert_relative_eq!(p.derivative_at(4.0e9), 2.0e-7, epsilon = 1e-15);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    /// Coefficients in `u`, lowest order first.
    coeffs: Vec<f64>,
    offset: f64,
    scale: f64,
}

impl Polynomial {
    /// Fit a polynomial of degree `deg` to `(x, y)`.
    pub fn fit(x: &[f64], y: &[f64], deg: usize) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::LengthMismatch {
                lhs: "x",
                lhs_len: x.len(),
                rhs: "y",
                rhs_len: y.len(),
            });
        }
        if x.len() <= deg {
            return Err(Error::invalid_arg(
                "x",
                format!("need more than {deg} points for a degree {deg} fit"),
            ));
        }

        let offset = x.iter().sum::<f64>() / x.len() as f64;
        let spread = x.iter().map(|v| (v - offset).abs()).fold(0.0, f64::max);
        let scale = if spread > 0.0 {
            spread
        } else if deg == 0 {
            1.0
        } else {
            return Err(Error::invalid_arg("x", "abscissae must not all be equal"));
        };

        let a = DMatrix::from_fn(x.len(), deg + 1, |i, j| {
            ((x[i] - offset) / scale).powi(j as i32)
        });
        let b = DVector::from_column_slice(y);
        let coeffs = lstsq(&a, &b)?;
        Ok(Self {
            coeffs: coeffs.iter().copied().collect(),
            offset,
            scale,
        })
    }

    /// Polynomial of degree zero evaluating to `value` everywhere.
    pub fn constant(value: f64) -> Self {
        Self {
            coeffs: vec![value],
            offset: 0.0,
            scale: 1.0,
        }
    }

    /// Degree of the polynomial.
    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    /// Evaluate at `x` with Horner's scheme.
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.offset) / self.scale;
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }

    /// First derivative with respect to `x`, evaluated at `x`.
    pub fn derivative_at(&self, x: f64) -> f64 {
        let u = (x - self.offset) / self.scale;
        let du = self
            .coeffs
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, c)| acc * u + k as f64 * c);
        du / self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic_is_recovered_exactly() {
        let x: Vec<f64> = (0..50).map(|i| 3.9e9 + 2.0e6 * i as f64).collect();
        let f = |v: f64| {
            let d = (v - 3.95e9) / 1e8;
            1.2 - 0.3 * d + 0.05 * d * d
        };
        let y: Vec<f64> = x.iter().map(|v| f(*v)).collect();
        let p = Polynomial::fit(&x, &y, 2).expect("fit");
        assert_eq!(p.degree(), 2);
        for v in [3.9e9, 3.97e9, 3.998e9] {
            assert_relative_eq!(p.eval(v), f(v), epsilon = 1e-10);
        }
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v * v * v - 2.0 * v).collect();
        let p = Polynomial::fit(&x, &y, 3).expect("fit");
        assert_relative_eq!(p.derivative_at(2.0), 3.0 * 4.0 - 2.0, epsilon = 1e-8);
    }

    #[test]
    fn constant_abscissa_only_supports_degree_zero() {
        let x = [1.0, 1.0, 1.0];
        let y = [2.0, 4.0, 6.0];
        assert!(Polynomial::fit(&x, &y, 1).is_err());
        let p = Polynomial::fit(&x, &y, 0).expect("mean");
        assert_relative_eq!(p.eval(10.0), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn too_few_points_is_rejected() {
        assert!(matches!(
            Polynomial::fit(&[1.0, 2.0], &[1.0, 2.0], 2),
            Err(Error::InvalidArg { .. })
        ));
        assert_relative_eq!(Polynomial::constant(3.5).eval(-7.0), 3.5);
    }
}
