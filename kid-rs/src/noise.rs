//! Noise spectra of calibrated timestreams.

use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle};
use crate::signal::binning::{LogBinConfig, LogBinKernel};
use crate::signal::spectral::{pow2_floor, PeriodogramConfig, PeriodogramKernel, WelchConfig, WelchKernel};
use crate::signal::traits::{LogBin1D, Periodogram1D, WelchPsd1D};
use crate::stats::nanmean;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Constructor config for [`NoiseAnalyzer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseAnalyzerConfig {
    /// Timestream sample rate, Hz.
    pub sample_rate: f64,
    /// Log-frequency binning.
    pub binning: LogBinConfig,
    /// Welch segment length; `None` selects a single periodogram over the
    /// largest power-of-two prefix.
    pub welch_nperseg: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Estimator {
    Periodogram(PeriodogramKernel),
    Welch(WelchKernel),
}

/// One-sided PSDs of `df/f` and of the tangential and radial components of
/// the corrected stream, with log binning.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseAnalyzer {
    estimator: Estimator,
    bins: LogBinKernel,
}

/// Spectra of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseResult {
    /// PSD frequencies, Hz.
    pub fft_freqs: Vec<f64>,
    /// PSD of `df/f`, 1/Hz.
    #[serde(rename = "Sxx")]
    pub sxx: Vec<f64>,
    /// PSD of the radial component over the circle radius.
    #[serde(rename = "S_per")]
    pub s_per: Vec<f64>,
    /// PSD of the tangential component over the circle radius.
    #[serde(rename = "S_par")]
    pub s_par: Vec<f64>,
    /// Mean frequency of each populated log bin.
    pub binned_freqs: Vec<f64>,
    /// Binned `Sxx`.
    #[serde(rename = "Sxx_binned")]
    pub sxx_binned: Vec<f64>,
    /// Binned `S_per`.
    #[serde(rename = "S_per_binned")]
    pub s_per_binned: Vec<f64>,
    /// Binned `S_par`.
    #[serde(rename = "S_par_binned")]
    pub s_par_binned: Vec<f64>,
    /// `Sxx_binned (S_par_binned - S_per_binned) / S_par_binned`.
    pub amp_subtracted: Vec<f64>,
    /// `Sxx` after common-mode removal.
    #[serde(rename = "Sxx_clean")]
    pub sxx_clean: Option<Vec<f64>>,
    /// Binned `Sxx_clean`.
    #[serde(rename = "Sxx_binned_clean")]
    pub sxx_binned_clean: Option<Vec<f64>>,
}

impl KernelLifecycle for NoiseAnalyzer {
    type Config = NoiseAnalyzerConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        let fs = config.sample_rate;
        let estimator = match config.welch_nperseg {
            Some(nperseg) => Estimator::Welch(WelchKernel::try_new(WelchConfig { fs, nperseg })?),
            None => Estimator::Periodogram(PeriodogramKernel::try_new(PeriodogramConfig { fs })?),
        };
        Ok(Self {
            estimator,
            bins: LogBinKernel::try_new(config.binning)?,
        })
    }
}

/// `NaN` samples replaced by the mean of the finite ones.
fn fill_nan(x: &[f64]) -> Result<Vec<f64>, ExecInvariantViolation> {
    let (mean, n) = nanmean(x.iter());
    if n == 0 {
        return Err(ExecInvariantViolation::InvalidState {
            reason: "timestream has no finite samples",
        });
    }
    Ok(x.iter().map(|v| if v.is_finite() { *v } else { mean }).collect())
}

impl NoiseAnalyzer {
    /// One-sided PSD of `x`.
    pub fn psd(&self, x: &[f64]) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation> {
        match &self.estimator {
            Estimator::Periodogram(kernel) => kernel.run_alloc(&x[..pow2_floor(x.len())]),
            Estimator::Welch(kernel) => kernel.run_alloc(x),
        }
    }

    /// Log-bin a PSD, returning `(bin_freqs, bin_means)`.
    pub fn bin(&self, freqs: &[f64], pxx: &[f64]) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation> {
        self.bins.run_alloc(freqs, pxx)
    }

    /// Spectra of one channel from its `df/f` and corrected stream.
    pub fn analyze(
        &self,
        df_over_f: &[f64],
        stream_corr: &[Complex64],
        radius: f64,
    ) -> Result<NoiseResult, ExecInvariantViolation> {
        if df_over_f.len() != stream_corr.len() {
            return Err(ExecInvariantViolation::LengthMismatch {
                arg: "stream_corr",
                expected: df_over_f.len(),
                got: stream_corr.len(),
            });
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ExecInvariantViolation::InvalidState {
                reason: "circle radius must be finite and > 0",
            });
        }

        let (fft_freqs, sxx) = self.psd(&fill_nan(df_over_f)?)?;
        let tangential: Vec<f64> = stream_corr.iter().map(|z| z.im / radius).collect();
        let radial_mean = stream_corr.iter().map(|z| z.re).sum::<f64>() / stream_corr.len() as f64;
        let radial: Vec<f64> = stream_corr.iter().map(|z| (z.re - radial_mean) / radius).collect();
        let (_, s_par) = self.psd(&tangential)?;
        let (_, s_per) = self.psd(&radial)?;

        let (binned_freqs, sxx_binned) = self.bin(&fft_freqs, &sxx)?;
        let (_, s_per_binned) = self.bin(&fft_freqs, &s_per)?;
        let (_, s_par_binned) = self.bin(&fft_freqs, &s_par)?;
        let amp_subtracted = sxx_binned
            .iter()
            .zip(s_par_binned.iter().zip(&s_per_binned))
            .map(|(sxx, (par, per))| sxx * (par - per) / par)
            .collect();

        Ok(NoiseResult {
            fft_freqs,
            sxx,
            s_per,
            s_par,
            binned_freqs,
            sxx_binned,
            s_per_binned,
            s_par_binned,
            amp_subtracted,
            sxx_clean: None,
            sxx_binned_clean: None,
        })
    }

    /// `result` with the spectra of a common-mode cleaned `df/f` attached.
    pub fn with_clean(&self, result: NoiseResult, cleaned: &[f64]) -> Result<NoiseResult, ExecInvariantViolation> {
        let (freqs, sxx_clean) = self.psd(&fill_nan(cleaned)?)?;
        let (_, sxx_binned_clean) = self.bin(&freqs, &sxx_clean)?;
        Ok(NoiseResult {
            sxx_clean: Some(sxx_clean),
            sxx_binned_clean: Some(sxx_binned_clean),
            ..result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use core::f64::consts::PI;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    const FS: f64 = 488.281_25;

    fn analyzer(welch_nperseg: Option<usize>) -> NoiseAnalyzer {
        NoiseAnalyzer::try_new(NoiseAnalyzerConfig {
            sample_rate: FS,
            binning: LogBinConfig::default(),
            welch_nperseg,
        })
        .expect("valid")
    }

    fn white(n: usize, sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(0.0, sigma).expect("normal");
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    fn level(pxx: &[f64]) -> f64 {
        // skip DC and Nyquist
        let inner = &pxx[1..pxx.len() - 1];
        inner.iter().sum::<f64>() / inner.len() as f64
    }

    #[test]
    fn components_are_separated_and_scaled_by_radius() {
        let n = 5000;
        let (st, sr, r) = (3e-3, 1e-3, 0.2);
        let t = white(n, st, 1);
        let p = white(n, sr, 2);
        let corr: Vec<Complex64> = t.iter().zip(&p).map(|(t, p)| Complex64::new(r + p, *t)).collect();
        let dff = white(n, 1e-6, 3);
        let res = analyzer(None).analyze(&dff, &corr, r).expect("spectra");

        assert_eq!(res.fft_freqs.len(), 4096 / 2 + 1);
        assert_relative_eq!(level(&res.s_par), 2.0 * (st / r).powi(2) / FS, max_relative = 0.1);
        assert_relative_eq!(level(&res.s_per), 2.0 * (sr / r).powi(2) / FS, max_relative = 0.1);
        assert_relative_eq!(level(&res.sxx), 2.0 * 1e-12 / FS, max_relative = 0.1);
        for (k, a) in res.amp_subtracted.iter().enumerate() {
            let expected = res.sxx_binned[k] * (res.s_par_binned[k] - res.s_per_binned[k]) / res.s_par_binned[k];
            assert_relative_eq!(*a, expected);
        }
    }

    #[test]
    fn tone_shows_as_peak_and_nan_is_filled() {
        let n = 4882;
        let mut x: Vec<f64> = (0..n).map(|k| 1e-4 * (2.0 * PI * k as f64 / FS).sin()).collect();
        x[17] = f64::NAN;
        let corr = vec![Complex64::new(1.0, 0.0); n];
        let res = analyzer(None).analyze(&x, &corr, 1.0).expect("spectra");
        let (k, _) = res
            .sxx
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .expect("non-empty");
        assert!((res.fft_freqs[k] - 1.0).abs() < FS / 4096.0);
        assert!(res.sxx.iter().all(|v| v.is_finite()));
        assert!(res.binned_freqs.iter().all(|f| *f >= 1e-3 && *f < 250.0));
    }

    #[test]
    fn welch_estimator_and_clean_spectra() {
        let x = white(4096, 1e-5, 9);
        let corr = vec![Complex64::new(1.0, 0.0); x.len()];
        let a = analyzer(Some(512));
        let res = a.analyze(&x, &corr, 1.0).expect("spectra");
        assert_eq!(res.fft_freqs.len(), 257);
        assert_relative_eq!(level(&res.sxx), 2.0 * 1e-10 / FS, max_relative = 0.1);
        assert!(res.sxx_clean.is_none());

        let cleaned: Vec<f64> = x.iter().map(|v| v / 2.0).collect();
        let res = a.with_clean(res, &cleaned).expect("clean");
        let clean = res.sxx_clean.as_ref().expect("clean spectrum");
        // DC holds only rounding residue after detrending
        for (c, s) in clean.iter().zip(&res.sxx).skip(1) {
            assert_relative_eq!(*c, s / 4.0, max_relative = 1e-9);
        }
        assert_eq!(
            res.sxx_binned_clean.as_ref().map(Vec::len),
            Some(res.sxx_binned.len())
        );
    }

    #[test]
    fn serialized_keys() {
        let x = white(256, 1.0, 4);
        let corr = vec![Complex64::new(1.0, 0.5); 256];
        let res = analyzer(None).analyze(&x, &corr, 1.0).expect("spectra");
        let json = serde_json::to_value(&res).expect("json");
        for key in [
            "fft_freqs",
            "Sxx",
            "S_per",
            "S_par",
            "binned_freqs",
            "Sxx_binned",
            "S_per_binned",
            "S_par_binned",
            "amp_subtracted",
            "Sxx_clean",
            "Sxx_binned_clean",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn all_nan_stream_is_rejected() {
        let x = vec![f64::NAN; 64];
        let corr = vec![Complex64::new(1.0, 0.0); 64];
        assert!(analyzer(None).analyze(&x, &corr, 1.0).is_err());
        assert!(analyzer(None).analyze(&x[..10], &corr, 1.0).is_err());
    }
}
