//! Batch pipeline configuration.

use crate::kernel::ConfigError;
use crate::resonator::ModelKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resonator solver limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Levenberg-Marquardt iteration cap.
    pub max_iterations: usize,
    /// Per-channel wall-clock budget in milliseconds.
    pub timeout_ms: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            timeout_ms: 10_000,
        }
    }
}

impl FitConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Spectral estimation and binning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Log-spaced bin count.
    pub n_bins: usize,
    /// Lowest bin edge in Hz.
    pub f_min: f64,
    /// Highest bin edge in Hz.
    pub f_max: f64,
    /// Use Welch averaging with this segment length instead of a single
    /// periodogram over the largest power-of-two prefix.
    pub welch_nperseg: Option<usize>,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            n_bins: 100,
            f_min: 1e-3,
            f_max: 250.0,
            welch_nperseg: None,
        }
    }
}

/// Configuration of a [`crate::pipeline::Pipeline`].
///
/// Every field has a default, so partial JSON documents deserialize:
///
/// ```
/// use kid_rs::config::PipelineConfig;
/// use kid_rs::resonator::ModelKind;
///
/// let cfg: PipelineConfig = serde_json::from_str(r#"{"model": "iq", "n_comp_pca": 1}"#).unwrap();
/// assert_eq!(cfg.model, ModelKind::Iq);
/// assert_eq!(cfg.gain_poly_order, 2);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overrides the stream record's sample rate when set (Hz).
    pub sample_rate: Option<f64>,
    /// Stream samples dropped from the start of each capture.
    pub skip_beginning: usize,
    /// Block-average factor applied to the stream after skipping.
    pub bin_num: Option<usize>,
    /// Fits above this reduced chi-squared are flagged.
    pub reduced_chi_squared_cutoff: f64,
    /// Principal components removed across channels; 0 disables PCA.
    pub n_comp_pca: usize,
    /// Resonator model used by the fitter.
    pub model: ModelKind,
    /// Run the resonator fitter.
    pub fit_resonators: bool,
    /// Rotate by the first fine point + pi instead of the stream median phase.
    pub rotate_fine_first: bool,
    /// Order of the gain amplitude polynomial.
    pub gain_poly_order: usize,
    /// Half-width of the phase window used by the phase to frequency map (rad).
    pub phase_limit: f64,
    /// Worker threads; defaults to the available parallelism.
    pub workers: Option<usize>,
    /// Solver limits.
    pub fit: FitConfig,
    /// Spectral settings.
    pub noise: NoiseConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            skip_beginning: 0,
            bin_num: None,
            reduced_chi_squared_cutoff: 10.0,
            n_comp_pca: 0,
            model: ModelKind::Magnitude,
            fit_resonators: true,
            rotate_fine_first: false,
            gain_poly_order: 2,
            phase_limit: core::f64::consts::FRAC_PI_2,
            workers: None,
            fit: FitConfig::default(),
            noise: NoiseConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Check value ranges that do not depend on the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(fs) = self.sample_rate {
            if !(fs.is_finite() && fs > 0.0) {
                return Err(ConfigError::InvalidArgument {
                    arg: "sample_rate",
                    reason: "sample_rate must be finite and > 0",
                });
            }
        }
        if self.bin_num == Some(0) {
            return Err(ConfigError::InvalidArgument {
                arg: "bin_num",
                reason: "bin_num must be > 0 when set",
            });
        }
        if !(self.reduced_chi_squared_cutoff > 0.0) {
            return Err(ConfigError::InvalidArgument {
                arg: "reduced_chi_squared_cutoff",
                reason: "cutoff must be > 0",
            });
        }
        if !(self.phase_limit > 0.0 && self.phase_limit < core::f64::consts::PI) {
            return Err(ConfigError::InvalidArgument {
                arg: "phase_limit",
                reason: "phase_limit must lie in (0, pi)",
            });
        }
        if self.workers == Some(0) {
            return Err(ConfigError::InvalidArgument {
                arg: "workers",
                reason: "workers must be > 0 when set",
            });
        }
        if self.fit.max_iterations == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "fit.max_iterations",
                reason: "max_iterations must be > 0",
            });
        }
        if self.fit.timeout_ms == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "fit.timeout_ms",
                reason: "timeout_ms must be > 0",
            });
        }
        if self.noise.welch_nperseg.is_some_and(|n| n < 2) {
            return Err(ConfigError::InvalidArgument {
                arg: "noise.welch_nperseg",
                reason: "welch_nperseg must be >= 2",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.noise.n_bins, 100);
        assert_eq!(cfg.fit.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_are_named() {
        let cfg = PipelineConfig {
            bin_num: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidArgument { arg: "bin_num", .. })
        ));
        let cfg = PipelineConfig {
            phase_limit: 4.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn nested_sections_deserialize_partially() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"fit": {"timeout_ms": 250}, "noise": {"welch_nperseg": 512}}"#)
                .expect("valid json");
        assert_eq!(cfg.fit.timeout_ms, 250);
        assert_eq!(cfg.fit.max_iterations, 1000);
        assert_eq!(cfg.noise.welch_nperseg, Some(512));
        assert_eq!(cfg.noise.f_max, 250.0);
    }
}
