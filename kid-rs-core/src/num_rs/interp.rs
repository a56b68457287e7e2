/// Return `num` evenly spaced samples over `[start, stop]`, numpy `linspace` style.
///
/// ```
/// use kid_rs_core::num_rs::linspace;
///
/// assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
/// assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
/// assert!(linspace(0.0, 1.0, 0).is_empty());
/// ```
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| {
                    if i == num - 1 {
                        stop
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        }
    }
}

/// Return `num` samples spaced evenly on a log scale, from `10^start` to `10^stop`.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs_core::num_rs::logspace;
///
/// let v = logspace(-3.0, 0.0, 4);
/// assert_relative_eq!(v[0], 1e-3, max_relative = 1e-12);
/// assert_relative_eq!(v[3], 1.0, max_relative = 1e-12);
/// ```
pub fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    linspace(start, stop, num)
        .into_iter()
        .map(|e| 10f64.powf(e))
        .collect()
}

/// One-dimensional linear interpolation, numpy `interp` style.
///
/// `xp` must be increasing. Queries left of `xp[0]` return `fp[0]`, queries
/// right of the last sample return the last `fp`. Empty tables yield `NaN`.
///
/// ```
/// use kid_rs_core::num_rs::interp;
///
/// let xp = [0.0, 1.0, 2.0];
/// let fp = [10.0, 20.0, 40.0];
/// assert_eq!(interp(0.5, &xp, &fp), 15.0);
/// assert_eq!(interp(1.5, &xp, &fp), 30.0);
/// assert_eq!(interp(-1.0, &xp, &fp), 10.0);
/// assert_eq!(interp(9.0, &xp, &fp), 40.0);
/// ```
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 || x.is_nan() {
        return f64::NAN;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    // first index with xp[idx] > x, guaranteed in 1..n
    let idx = xp[..n].partition_point(|v| *v <= x);
    let (x0, x1) = (xp[idx - 1], xp[idx]);
    let (f0, f1) = (fp[idx - 1], fp[idx]);
    if x1 == x0 {
        return f0;
    }
    f0 + (f1 - f0) * (x - x0) / (x1 - x0)
}
