//! Peak location and half-width estimation on sampled traces.
//!
//! Resonances appear as dips in `|S21|`; callers negate the trace so the dip
//! becomes a peak before using these helpers.

use core::cmp::Ordering;

/// Options for [`find_peaks`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FindPeaksOptions {
    /// Minimum peak height.
    pub height: Option<f64>,
    /// Minimum index distance between retained peaks.
    pub distance: Option<usize>,
}

/// Prominence result bundle for [`peak_prominences`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeakProminences {
    /// Prominence value for each input peak index.
    pub prominences: Vec<f64>,
    /// Left base index for each peak.
    pub left_bases: Vec<usize>,
    /// Right base index for each peak.
    pub right_bases: Vec<usize>,
}

/// Width result bundle for [`peak_widths`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeakWidths {
    /// Width of each peak at the evaluated height, in samples.
    pub widths: Vec<f64>,
    /// Height level used for each width.
    pub width_heights: Vec<f64>,
    /// Left interpolated intersection point (index domain).
    pub left_ips: Vec<f64>,
    /// Right interpolated intersection point (index domain).
    pub right_ips: Vec<f64>,
}

/// Find strict interior local maxima with optional height and distance filtering.
///
/// When `distance` is set, taller peaks win over their neighbours.
///
/// ```
/// use kid_rs::signal::peak::{find_peaks, FindPeaksOptions};
///
/// let x = [0.0, 1.0, 0.1, 0.9, 0.0, 2.0, 0.0];
/// let opts = FindPeaksOptions { height: Some(0.5), distance: Some(3) };
/// assert_eq!(find_peaks(&x, opts), vec![1, 5]);
/// ```
pub fn find_peaks(x: &[f64], options: FindPeaksOptions) -> Vec<usize> {
    if x.len() < 3 {
        return Vec::new();
    }
    let mut peaks: Vec<usize> = (1..x.len() - 1)
        .filter(|&i| x[i] > x[i - 1] && x[i] > x[i + 1])
        .collect();

    if let Some(height) = options.height {
        peaks.retain(|&idx| x[idx] >= height);
    }

    if let Some(distance) = options.distance {
        if distance > 1 && !peaks.is_empty() {
            let mut ranked = peaks.clone();
            ranked.sort_by(|&a, &b| x[b].partial_cmp(&x[a]).unwrap_or(Ordering::Equal));

            let mut selected: Vec<usize> = Vec::new();
            for cand in ranked {
                if selected.iter().all(|&kept| kept.abs_diff(cand) >= distance) {
                    selected.push(cand);
                }
            }
            selected.sort_unstable();
            peaks = selected;
        }
    }

    peaks
}

/// Compute peak prominences and base indices.
///
/// Out-of-range peak indices are skipped. Edge samples are valid peaks here,
/// which matters for dips that sit close to the end of a sweep.
pub fn peak_prominences(x: &[f64], peaks: &[usize]) -> PeakProminences {
    let mut out = PeakProminences {
        prominences: Vec::with_capacity(peaks.len()),
        left_bases: Vec::with_capacity(peaks.len()),
        right_bases: Vec::with_capacity(peaks.len()),
    };

    for &peak in peaks.iter().filter(|&&p| p < x.len()) {
        let peak_val = x[peak];

        let (mut left_min, mut left_base) = (peak_val, peak);
        for i in (0..peak).rev() {
            if x[i] > peak_val {
                break;
            }
            if x[i] < left_min {
                left_min = x[i];
                left_base = i;
            }
        }

        let (mut right_min, mut right_base) = (peak_val, peak);
        for (i, &v) in x.iter().enumerate().skip(peak + 1) {
            if v > peak_val {
                break;
            }
            if v < right_min {
                right_min = v;
                right_base = i;
            }
        }

        out.prominences.push(peak_val - left_min.max(right_min));
        out.left_bases.push(left_base);
        out.right_bases.push(right_base);
    }

    out
}

/// Compute peak widths at `rel_height` of each peak's prominence.
///
/// Intersection points are linearly interpolated between samples, so the
/// left and right half-widths (`peak - left_ips`, `right_ips - peak`) can
/// differ for asymmetric line shapes.
pub fn peak_widths(x: &[f64], peaks: &[usize], rel_height: f64) -> PeakWidths {
    let prom = peak_prominences(x, peaks);
    let valid_peaks = peaks.iter().copied().filter(|&p| p < x.len());
    let n = prom.prominences.len();
    let mut out = PeakWidths {
        widths: Vec::with_capacity(n),
        width_heights: Vec::with_capacity(n),
        left_ips: Vec::with_capacity(n),
        right_ips: Vec::with_capacity(n),
    };

    for (i, peak) in valid_peaks.enumerate() {
        let width_height = x[peak] - prom.prominences[i] * rel_height;

        let mut l = peak;
        while l > prom.left_bases[i] && x[l] > width_height {
            l -= 1;
        }
        let l_ip = if l < peak && x[l + 1] != x[l] {
            l as f64 + (width_height - x[l]) / (x[l + 1] - x[l])
        } else {
            l as f64
        };

        let mut r = peak;
        while r < prom.right_bases[i] && x[r] > width_height {
            r += 1;
        }
        let r_ip = if r > peak && x[r - 1] != x[r] {
            r as f64 - (width_height - x[r]) / (x[r - 1] - x[r])
        } else {
            r as f64
        };

        out.widths.push(r_ip - l_ip);
        out.width_heights.push(width_height);
        out.left_ips.push(l_ip);
        out.right_ips.push(r_ip);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn find_peaks_skips_edges_and_plateaus() {
        let x = [5.0, 1.0, 2.0, 2.0, 1.0, 3.0, 0.0];
        assert_eq!(find_peaks(&x, FindPeaksOptions::default()), vec![5]);
    }

    #[test]
    fn prominence_uses_higher_base() {
        let x = [0.0, 1.0, 0.2, 0.8, 0.1, 2.0, 0.0];
        let prom = peak_prominences(&x, &[1, 5, 99]);
        assert_eq!(prom.prominences.len(), 2);
        assert_abs_diff_eq!(prom.prominences[0], 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(prom.prominences[1], 2.0, epsilon = 1e-12);
        assert_eq!(prom.left_bases[1], 0);
        assert_eq!(prom.right_bases[1], 6);
    }

    #[test]
    fn peak_width_matches_simple_triangle() {
        let x = [0.0, 1.0, 0.0];
        let widths = peak_widths(&x, &[1], 0.5);
        assert_abs_diff_eq!(widths.widths[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(widths.width_heights[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn asymmetric_dip_gives_unequal_half_widths() {
        // Inverted dip with a shallow right flank.
        let x = [-1.0, -1.0, -0.2, 0.0, -0.25, -0.5, -0.75, -1.0];
        let w = peak_widths(&x, &[3], 0.5);
        let left = 3.0 - w.left_ips[0];
        let right = w.right_ips[0] - 3.0;
        assert_abs_diff_eq!(left, 1.0 + 0.3 / 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(right, 2.0, epsilon = 1e-12);
    }
}
