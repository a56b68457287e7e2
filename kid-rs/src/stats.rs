//! Reductions used across the calibration and noise stages.

use core::{borrow::Borrow, f64::consts::PI, iter::Sum, ops::Add};
use num_complex::Complex64;
use num_traits::{Float, Num, NumCast};

///
/// Compute the mean of the signal, `y`
///
/// Return the mean and the number of points averaged
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::mean;
///
/// let y: [f64; 5] = [1.,2.,3.,4.,5.];
/// assert_relative_eq!(3f64, mean(y.iter()).0);
///
/// let y: &[f32] = &[];
/// assert_eq!((0f32, 0), mean(y.iter()));
/// ```
///
pub fn mean<YI, F>(y: YI) -> (F, usize)
where
    F: Num + NumCast + Default + Copy + Add,
    YI: Iterator,
    YI::Item: Borrow<F>,
{
    let (sum, count) = y.fold(Default::default(), |acc: (F, usize), yi| {
        (acc.0 + *yi.borrow(), acc.1 + 1)
    });
    match F::from(count) {
        Some(n) if count > 0 => (sum / n, count),
        _ => Default::default(),
    }
}

///
/// Mean over the finite values of `y`, ignoring `NaN`/`inf`.
///
/// Returns `NaN` and a zero count when no finite value is present.
///
/// ```
/// use kid_rs::stats::nanmean;
///
/// let y = [1.0, f64::NAN, 3.0];
/// assert_eq!(nanmean(y.iter()), (2.0, 2));
/// assert!(nanmean([f64::NAN].iter()).0.is_nan());
/// ```
pub fn nanmean<YI>(y: YI) -> (f64, usize)
where
    YI: Iterator,
    YI::Item: Borrow<f64>,
{
    let (sum, count) = y
        .map(|v| *v.borrow())
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |acc, v| (acc.0 + v, acc.1 + 1));
    if count == 0 {
        (f64::NAN, 0)
    } else {
        (sum / count as f64, count)
    }
}

///
/// Compute the variance of the signal, `y`
///
/// Return the variance and the number of points averaged
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::variance;
///
/// let y: [f64; 5] = [1.,2.,3.,4.,5.];
/// assert_relative_eq!(2f64, variance(y.iter()).0);
/// ```
///
pub fn variance<YI, F>(y: YI) -> (F, usize)
where
    F: Float + Default + Sum,
    YI: Iterator + Clone,
    YI::Item: Borrow<F>,
{
    let (avg, n) = mean(y.clone());
    let sum: F = y
        .map(|f| {
            let delta = *f.borrow() - avg;
            delta * delta
        })
        .sum::<F>();
    match F::from(n) {
        Some(nf) if n > 0 => (sum / nf, n),
        _ => Default::default(),
    }
}

///
/// Compute the standard deviation of the signal, `y`
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::stdev;
///
/// let y: [f64; 5] = [1.,2.,3.,4.,5.];
/// assert_relative_eq!(1.41421356237, stdev(y.iter()).0, max_relative = 1e-8);
/// ```
pub fn stdev<YI, F>(y: YI) -> (F, usize)
where
    F: Float + Default + Sum,
    YI: Iterator + Clone,
    YI::Item: Borrow<F>,
{
    match variance(y) {
        (_, 0) => Default::default(),
        (v, n) => (v.sqrt(), n),
    }
}

///
/// Root mean square of the finite values of `y` about zero.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::rms;
///
/// assert_relative_eq!(rms([3.0, -3.0, f64::NAN].iter()), 3.0);
/// ```
pub fn rms<YI>(y: YI) -> f64
where
    YI: Iterator,
    YI::Item: Borrow<f64>,
{
    nanmean(y.map(|v| {
        let v = *v.borrow();
        v * v
    }))
    .0
    .sqrt()
}

// Quick select finds the `k`th smallest element with 2N comparisons
fn quickselect<T>(y: &[T], k: usize) -> T
where
    T: PartialOrd + Copy,
{
    let n = y.len();
    if n == 1 {
        return y[0];
    }

    let pivot = y[n / 2];
    let lower = y.iter().copied().filter(|yi| *yi < pivot).collect::<Vec<_>>();
    let upper = y.iter().copied().filter(|yi| *yi > pivot).collect::<Vec<_>>();
    let pivots = n - lower.len() - upper.len();

    if k < lower.len() {
        quickselect(&lower, k)
    } else if k < lower.len() + pivots {
        pivot
    } else {
        quickselect(&upper, k - lower.len() - pivots)
    }
}

///
/// Compute the median of the signal, `y`
///
/// Return the median and the number of points considered. `NaN` values are
/// skipped.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::median;
///
/// let y: [f64; 5] = [3.,1.,4.,2.,5.];
/// assert_relative_eq!(3f64, median(y.iter()).0);
///
/// let y: [f64; 4] = [1.,2.,3.,4.];
/// assert_relative_eq!(2.5f64, median(y.iter()).0);
///
/// let y: &[f64] = &[];
/// assert_eq!((0f64, 0), median(y.iter()));
/// ```
///
pub fn median<YI, F>(y: YI) -> (F, usize)
where
    F: Float + Default,
    YI: Iterator,
    YI::Item: Borrow<F>,
{
    // Materialize the values in order to run O(n) quick select
    let y = y
        .map(|v| *v.borrow())
        .filter(|v| !v.is_nan())
        .collect::<Vec<_>>();
    let n = y.len();
    let two = F::one() + F::one();
    match n {
        0 => Default::default(),
        1 => (y[0], 1),
        _ if n % 2 == 1 => (quickselect(&y, n / 2), n),
        _ => (
            (quickselect(&y, n / 2 - 1) + quickselect(&y, n / 2)) / two,
            n,
        ),
    }
}

/// Wrap an angle into `(-pi, pi]`.
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

///
/// Median phase of a cluster of complex points.
///
/// Phases are measured relative to the direction of the cluster mean before
/// taking the median, so clusters straddling the `+-pi` branch cut are handled.
/// The result is wrapped into `(-pi, pi]`; `None` for an empty cluster.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs::stats::circular_median_phase;
/// use num_complex::Complex64;
///
/// let z: Vec<Complex64> = [3.1, -3.1, 3.12]
///     .iter()
///     .map(|p| Complex64::from_polar(1.0, *p))
///     .collect();
/// assert_relative_eq!(circular_median_phase(&z).unwrap(), 3.12, epsilon = 1e-9);
/// ```
pub fn circular_median_phase(z: &[Complex64]) -> Option<f64> {
    if z.is_empty() {
        return None;
    }
    let centroid = z.iter().sum::<Complex64>() / z.len() as f64;
    let reference = if centroid.norm() > 0.0 {
        centroid.arg()
    } else {
        z[0].arg()
    };
    let offsets = z.iter().map(|p| wrap_phase(p.arg() - reference));
    let (offset, n) = median::<_, f64>(offsets);
    (n > 0).then(|| wrap_phase(reference + offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn median_even_and_odd() {
        let y: [f64; 4] = [1., 2., 3., 4.];
        assert_relative_eq!(2.5, median::<_, f64>(y.iter()).0);
        let y: [f64; 6] = [3., 1., 4., 2., 3., 5.];
        assert_relative_eq!(3.0, median::<_, f64>(y.iter()).0);
    }

    #[test]
    fn median_skips_nan() {
        let y = [f64::NAN, 1.0, 2.0, 10.0];
        assert_eq!(median::<_, f64>(y.iter()), (2.0, 3));
    }

    #[test]
    fn wrap_phase_is_half_open() {
        assert_relative_eq!(wrap_phase(3.0 * PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(-PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(0.5 - 4.0 * PI), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn circular_median_matches_plain_median_away_from_cut() {
        let phases = [0.1, 0.3, -0.2, 0.25, 0.05];
        let z: Vec<Complex64> = phases
            .iter()
            .map(|p| Complex64::from_polar(2.0, *p))
            .collect();
        assert_relative_eq!(
            circular_median_phase(&z).expect("non-empty"),
            0.1,
            epsilon = 1e-12
        );
        assert!(circular_median_phase(&[]).is_none());
    }

    #[test]
    fn variance_and_stdev_of_constant_are_zero() {
        let y = [4.0f64; 8];
        assert_relative_eq!(variance::<_, f64>(y.iter()).0, 0.0);
        assert_relative_eq!(stdev::<_, f64>(y.iter()).0, 0.0);
    }
}
