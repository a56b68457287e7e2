use core::f64::consts::{PI, TAU};

/// Best effort parallel behaviour with numpy's `unwrap` (default `discont = pi`).
///
/// Adds multiples of `2 pi` so that successive samples never jump by more than `pi`.
///
/// ```
/// use approx::assert_relative_eq;
/// use kid_rs_core::num_rs::unwrap;
///
/// let wrapped = [3.0, -3.0, -2.9];
/// let unwrapped = unwrap(&wrapped);
/// assert_relative_eq!(unwrapped[1], -3.0 + core::f64::consts::TAU, epsilon = 1e-12);
/// assert_relative_eq!(unwrapped[2], -2.9 + core::f64::consts::TAU, epsilon = 1e-12);
/// ```
pub fn unwrap(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut correction = 0.0;
    for (i, &p) in phase.iter().enumerate() {
        if i > 0 {
            let d = p - phase[i - 1];
            if d.abs() >= PI {
                let mut dd = (d + PI).rem_euclid(TAU) - PI;
                if dd == -PI && d > 0.0 {
                    dd = PI;
                }
                correction += dd - d;
            }
        }
        out.push(p + correction);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn unwraps_linear_ramp() {
        let truth: Vec<f64> = (0..200).map(|i| -0.37 * i as f64).collect();
        let wrapped: Vec<f64> = truth
            .iter()
            .map(|v| (v + PI).rem_euclid(TAU) - PI)
            .collect();
        let unwrapped = unwrap(&wrapped);
        let offset = unwrapped[0] - truth[0];
        for (u, t) in unwrapped.iter().zip(truth.iter()) {
            assert_relative_eq!(u - offset, *t, epsilon = 1e-9);
        }
    }

    #[test]
    fn empty_and_single() {
        assert!(unwrap(&[]).is_empty());
        assert_eq!(unwrap(&[1.5]), vec![1.5]);
    }
}
