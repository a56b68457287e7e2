use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Best effort parallel behaviour with numpy's `linalg.lstsq`.
///
/// Returns the vector `x` minimizing `||a x - b||_2`, solved through the SVD of `a`.
/// Singular values below `eps * max(m, n) * s_max` are discarded; when that
/// leaves fewer than `a.ncols()` usable directions the system is reported as
/// [`Error::Singular`] instead of silently returning a minimum-norm solution.
///
/// # Examples
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs_core::num_rs::lstsq;
/// use nalgebra::{DMatrix, DVector};
///
/// // y = 2 + 3x sampled without noise
/// let a = DMatrix::from_row_slice(3, 2, &[1., 0., 1., 1., 1., 2.]);
/// let b = DVector::from_vec(vec![2., 5., 8.]);
/// let x = lstsq(&a, &b).unwrap();
/// assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
/// assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
/// ```
pub fn lstsq(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    if a.nrows() != b.len() {
        return Err(Error::LengthMismatch {
            lhs: "a",
            lhs_len: a.nrows(),
            rhs: "b",
            rhs_len: b.len(),
        });
    }
    if a.nrows() == 0 || a.ncols() == 0 {
        return Err(Error::invalid_arg("a", "design matrix must be non-empty"));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(Error::invalid_arg("a", "inputs must be finite"));
    }

    let svd = a.clone().svd(true, true);
    let s_max = svd.singular_values.max();
    if s_max <= 0.0 {
        return Err(Error::Singular {
            reason: "all singular values are zero".to_string(),
        });
    }
    let eps = f64::EPSILON * a.nrows().max(a.ncols()) as f64 * s_max;
    let rank = svd.singular_values.iter().filter(|s| **s > eps).count();
    if rank < a.ncols() {
        return Err(Error::Singular {
            reason: format!("rank {rank} < {} unknowns", a.ncols()),
        });
    }
    svd.solve(b, eps).map_err(|reason| Error::Singular {
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn overdetermined_line_fit() {
        let xs = [0.0f64, 1.0, 2.0, 3.0, 4.0];
        let a = DMatrix::from_fn(xs.len(), 2, |i, j| if j == 0 { 1.0 } else { xs[i] });
        let b = DVector::from_iterator(xs.len(), xs.iter().map(|x| -1.5 + 0.25 * x));
        let x = lstsq(&a, &b).expect("solvable");
        assert_relative_eq!(x[0], -1.5, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn rank_deficient_is_singular() {
        let a = DMatrix::from_row_slice(3, 2, &[1., 2., 2., 4., 3., 6.]);
        let b = DVector::from_vec(vec![1., 2., 3.]);
        assert!(matches!(lstsq(&a, &b), Err(Error::Singular { .. })));
    }

    #[test]
    fn mismatched_rhs_is_rejected() {
        let a = DMatrix::<f64>::zeros(3, 2);
        let b = DVector::<f64>::zeros(2);
        assert!(matches!(lstsq(&a, &b), Err(Error::LengthMismatch { .. })));
    }
}
