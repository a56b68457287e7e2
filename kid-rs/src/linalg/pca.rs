//! Cross-channel principal component removal.

use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle};
use crate::stats::nanmean;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2, Axis};
use tracing::debug;

/// Constructor config for [`PcaCleanKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcaCleanConfig {
    /// Number of leading principal components to remove.
    pub n_components: usize,
}

/// Output of [`PcaCleanKernel::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct PcaClean {
    /// `channels x samples` data with the leading components projected out.
    /// Channel means are restored.
    pub cleaned: Array2<f64>,
    /// Eigenvalues of the channel covariance, descending.
    pub eigenvalues: Vec<f64>,
    /// Removed components as `channels x n_components` unit columns.
    pub components: Array2<f64>,
}

/// Removes the top-`n` eigenvectors of the channel covariance from a
/// `channels x samples` matrix.
///
/// `NaN` samples are replaced by their channel's mean before decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcaCleanKernel {
    n_components: usize,
}

impl KernelLifecycle for PcaCleanKernel {
    type Config = PcaCleanConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if config.n_components == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "n_components",
                reason: "n_components must be > 0",
            });
        }
        Ok(Self {
            n_components: config.n_components,
        })
    }
}

impl PcaCleanKernel {
    /// Number of components removed.
    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Project the leading components out of `data` (`channels x samples`).
    pub fn run(&self, data: ArrayView2<'_, f64>) -> Result<PcaClean, ExecInvariantViolation> {
        let (nch, nsamp) = data.dim();
        if self.n_components >= nch {
            return Err(ConfigError::InvalidArgument {
                arg: "n_components",
                reason: "n_components must be smaller than the channel count",
            }
            .into());
        }
        if nsamp == 0 {
            return Err(ConfigError::EmptyInput { arg: "data" }.into());
        }

        let means: Vec<f64> = data
            .axis_iter(Axis(0))
            .map(|row| match nanmean(row.iter()) {
                (_, 0) => 0.0,
                (m, _) => m,
            })
            .collect();
        let centred = DMatrix::from_fn(nch, nsamp, |i, j| {
            let v = data[[i, j]];
            if v.is_finite() {
                v - means[i]
            } else {
                0.0
            }
        });

        let cov = (&centred * centred.transpose()) / nsamp as f64;
        let eigen = SymmetricEigen::new(cov);
        let mut order: Vec<usize> = (0..nch).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let basis = DMatrix::from_fn(nch, self.n_components, |i, k| {
            eigen.eigenvectors[(i, order[k])]
        });
        let projected = &basis * (basis.transpose() * &centred);
        let residual = centred - projected;

        let eigenvalues: Vec<f64> = order.iter().map(|&k| eigen.eigenvalues[k]).collect();
        debug!(
            channels = nch,
            removed = self.n_components,
            leading = eigenvalues.first().copied().unwrap_or(0.0),
            "pca common mode removed"
        );

        Ok(PcaClean {
            cleaned: Array2::from_shape_fn((nch, nsamp), |(i, j)| residual[(i, j)] + means[i]),
            eigenvalues,
            components: Array2::from_shape_fn((nch, self.n_components), |(i, k)| basis[(i, k)]),
        })
    }
}
