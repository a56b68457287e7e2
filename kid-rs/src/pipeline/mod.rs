//! Batch orchestration: shape checks, per-channel fan-out on a bounded
//! worker pool, the cross-channel PCA barrier and per-channel status.

mod multi;

pub use multi::{MultiChannelReport, MultiStreamOutput};

use crate::calibrate::{
    CalibrationRecord, ChannelCalibrator, ChannelCalibratorConfig, ChannelSweeps, StreamPreprocessor,
    StreamPreprocessorConfig, StreamTiming,
};
use crate::config::PipelineConfig;
use crate::error::{FitError, PipelineError};
use crate::kernel::{ConfigError, KernelLifecycle};
use crate::linalg::{CircleFitConfig, PcaCleanConfig, PcaCleanKernel};
use crate::noise::{NoiseAnalyzer, NoiseAnalyzerConfig, NoiseResult};
use crate::records::{StreamRecord, SweepRecord};
use crate::resonator::window::Windowing;
use crate::resonator::{FitResult, ResonanceFitter, ResonanceFitterConfig};
use crate::signal::binning::LogBinConfig;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

/// Outcome class of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Every stage succeeded.
    Ok,
    /// The resonator fit failed; the fit is the zero vector.
    FitFailed,
    /// The fit converged above the reduced chi-squared cutoff.
    BadChiSquared,
    /// Too few points survived windowing to fit.
    WindowingDegenerate,
    /// Calibration or noise analysis failed.
    CalibrationFailed,
}

/// Per-channel results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    /// Channel index.
    pub channel: usize,
    /// Outcome class.
    pub status: ChannelStatus,
    /// Failure reason, if any.
    pub detail: Option<String>,
    /// Resonator fit; `None` when fitting is disabled.
    pub fit: Option<FitResult>,
    /// Calibration; `None` on calibration failure.
    pub calibration: Option<CalibrationRecord>,
    /// Noise spectra; `None` on calibration failure.
    pub noise: Option<NoiseResult>,
}

/// Results of one batch, in channel order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// One report per channel.
    pub channels: Vec<ChannelReport>,
    /// Stream sample rate after averaging, Hz.
    pub sample_rate: f64,
    /// Channel-covariance eigenvalues when PCA ran, descending.
    pub pca_eigenvalues: Option<Vec<f64>>,
}

impl BatchOutput {
    /// Number of channels with `status`.
    pub fn count(&self, status: ChannelStatus) -> usize {
        self.channels.iter().filter(|c| c.status == status).count()
    }
}

/// The batch pipeline, configured once and run on any number of records.
///
/// ```
/// use kid_rs::config::PipelineConfig;
/// use kid_rs::kernel::KernelLifecycle;
/// use kid_rs::pipeline::Pipeline;
///
/// let bad = PipelineConfig { workers: Some(0), ..Default::default() };
/// assert!(Pipeline::try_new(bad).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    fitter: ResonanceFitter,
    calibrator: ChannelCalibrator,
    preprocessor: StreamPreprocessor,
}

impl KernelLifecycle for Pipeline {
    type Config = PipelineConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let fitter = ResonanceFitter::try_new(ResonanceFitterConfig {
            model: config.model,
            max_iterations: config.fit.max_iterations,
            timeout: Some(config.fit.timeout()),
            ..Default::default()
        })?;
        let calibrator = ChannelCalibrator::try_new(ChannelCalibratorConfig {
            gain_poly_order: config.gain_poly_order,
            rotate_fine_first: config.rotate_fine_first,
            phase_limit: config.phase_limit,
            circle: CircleFitConfig::default(),
        })?;
        let preprocessor = StreamPreprocessor::try_new(StreamPreprocessorConfig {
            skip_beginning: config.skip_beginning,
            bin_num: config.bin_num,
        })?;
        Ok(Self {
            config,
            fitter,
            calibrator,
            preprocessor,
        })
    }
}

/// Per-channel fit outcome before calibration.
struct FitOutcome {
    fit: Option<FitResult>,
    status: ChannelStatus,
    detail: Option<String>,
}

impl Pipeline {
    /// Configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn check_shapes(&self, fine: &SweepRecord, gain: &SweepRecord, stream: &StreamRecord) -> Result<(), PipelineError> {
        let nch = fine.n_channels();
        if gain.n_channels() != nch {
            return Err(PipelineError::ShapeMismatch {
                what: "gain sweep channels",
                expected: nch,
                got: gain.n_channels(),
            });
        }
        if stream.n_channels() != nch {
            return Err(PipelineError::ShapeMismatch {
                what: "stream channels",
                expected: nch,
                got: stream.n_channels(),
            });
        }
        Ok(())
    }

    fn timing(&self, stream: &StreamRecord) -> Result<StreamTiming, PipelineError> {
        let fs = self.config.sample_rate.unwrap_or(stream.sample_rate());
        Ok(self.preprocessor.timing(stream.packet_count(), fs)?)
    }

    /// Run `work` for every channel, on the worker pool when available,
    /// keeping channel order.
    fn fan_out<T, F>(&self, nch: usize, work: F) -> Result<Vec<T>, PipelineError>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers.unwrap_or(0))
                .build()
                .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
            Ok(pool.install(|| (0..nch).into_par_iter().map(work).collect()))
        }

        #[cfg(not(feature = "parallel"))]
        {
            Ok((0..nch).map(work).collect())
        }
    }

    fn sweeps(
        &self,
        ch: usize,
        fine: &SweepRecord,
        gain: &SweepRecord,
        windowing: &Windowing,
        tone_freq: Option<f64>,
    ) -> ChannelSweeps {
        let gain_freqs = gain.freqs(ch);
        ChannelSweeps {
            fine_freqs: fine.freqs(ch),
            fine_z: fine.z(ch),
            gain_fit: gain_freqs.iter().map(|f| !windowing.near_any_resonance(*f)).collect(),
            gain_freqs,
            gain_z: gain.z(ch),
            tone_freq: tone_freq.unwrap_or_else(|| fine.centre(ch)),
        }
    }

    fn fit_channel(&self, ch: usize, fine: &SweepRecord, gain: &SweepRecord, windowing: &Windowing) -> FitOutcome {
        if !self.config.fit_resonators {
            return FitOutcome {
                fit: None,
                status: ChannelStatus::Ok,
                detail: None,
            };
        }
        let fitted = windowing
            .window(ch, fine, gain, self.fitter.min_points())
            .and_then(|w| self.fitter.fit(&w));
        match fitted {
            Ok(fit) if fit.reduced_chi_squared > self.config.reduced_chi_squared_cutoff => {
                warn!(
                    reduced_chi_squared = fit.reduced_chi_squared,
                    cutoff = self.config.reduced_chi_squared_cutoff,
                    "fit above reduced chi-squared cutoff"
                );
                FitOutcome {
                    detail: Some(format!(
                        "reduced chi-squared {:.3} above cutoff {}",
                        fit.reduced_chi_squared, self.config.reduced_chi_squared_cutoff
                    )),
                    fit: Some(fit),
                    status: ChannelStatus::BadChiSquared,
                }
            }
            Ok(fit) => FitOutcome {
                fit: Some(fit),
                status: ChannelStatus::Ok,
                detail: None,
            },
            Err(err) => {
                warn!(%err, "resonator fit failed");
                let status = match err {
                    FitError::Windowing { .. } => ChannelStatus::WindowingDegenerate,
                    _ => ChannelStatus::FitFailed,
                };
                FitOutcome {
                    fit: Some(FitResult::failed(self.fitter.kind())),
                    status,
                    detail: Some(err.to_string()),
                }
            }
        }
    }

    fn process_channel(
        &self,
        ch: usize,
        records: (&SweepRecord, &SweepRecord, &StreamRecord),
        windowing: &Windowing,
        timing: &StreamTiming,
        analyzer: &NoiseAnalyzer,
    ) -> ChannelReport {
        let (fine, gain, stream) = records;
        let _span = info_span!("channel", ch).entered();
        let outcome = self.fit_channel(ch, fine, gain, windowing);

        let calibrated = self
            .preprocessor
            .samples(&stream.z(ch))
            .and_then(|z| {
                let sweeps = self.sweeps(ch, fine, gain, windowing, stream.tone_freq(ch));
                self.calibrator.calibrate(&sweeps, z, timing.clone())
            })
            .map_err(|err| err.to_string())
            .and_then(|rec| {
                analyzer
                    .analyze(&rec.stream_df_over_f, &rec.stream_corr, rec.r)
                    .map(|noise| (rec, noise))
                    .map_err(|err| format!("noise analysis: {err}"))
            });

        match calibrated {
            Ok((rec, noise)) => ChannelReport {
                channel: ch,
                status: outcome.status,
                detail: outcome.detail,
                fit: outcome.fit,
                calibration: Some(rec),
                noise: Some(noise),
            },
            Err(detail) => {
                warn!(%detail, "channel calibration failed");
                ChannelReport {
                    channel: ch,
                    status: ChannelStatus::CalibrationFailed,
                    detail: Some(detail),
                    fit: outcome.fit,
                    calibration: None,
                    noise: None,
                }
            }
        }
    }

    /// Remove common modes from the calibrated channels and attach the
    /// cleaned spectra. Returns the eigenvalues when PCA ran.
    fn pca_barrier(
        &self,
        reports: &mut [ChannelReport],
        analyzer: &NoiseAnalyzer,
    ) -> Result<Option<Vec<f64>>, PipelineError> {
        let n_comp = self.config.n_comp_pca;
        let rows: Vec<usize> = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.calibration.is_some() && r.noise.is_some())
            .map(|(k, _)| k)
            .collect();
        if rows.len() <= n_comp {
            warn!(
                calibrated = rows.len(),
                n_comp_pca = n_comp,
                "too few calibrated channels for common-mode removal, skipping"
            );
            return Ok(None);
        }

        let nsamp = reports[rows[0]]
            .calibration
            .as_ref()
            .map_or(0, |c| c.stream_df_over_f.len());
        let mut data = Array2::zeros((rows.len(), nsamp));
        for (row, &k) in rows.iter().enumerate() {
            if let Some(rec) = &reports[k].calibration {
                for (dst, src) in data.row_mut(row).iter_mut().zip(&rec.stream_df_over_f) {
                    *dst = *src;
                }
            }
        }

        let pca = PcaCleanKernel::try_new(PcaCleanConfig { n_components: n_comp })?.run(data.view())?;
        for (row, &k) in rows.iter().enumerate() {
            let cleaned = pca.cleaned.row(row).to_vec();
            if let Some(noise) = reports[k].noise.take() {
                reports[k].noise = Some(analyzer.with_clean(noise, &cleaned)?);
            }
        }
        Ok(Some(pca.eigenvalues))
    }

    /// Fit, calibrate and analyze every channel of one capture.
    ///
    /// Structural problems (channel counts, `n_comp_pca` against the channel
    /// count) are fatal; per-channel failures are reported in the output.
    pub fn run(&self, fine: &SweepRecord, gain: &SweepRecord, stream: &StreamRecord) -> Result<BatchOutput, PipelineError> {
        self.check_shapes(fine, gain, stream)?;
        let nch = fine.n_channels();
        if self.config.n_comp_pca > 0 && self.config.n_comp_pca >= nch {
            return Err(ConfigError::InvalidArgument {
                arg: "n_comp_pca",
                reason: "n_comp_pca must be smaller than the channel count",
            }
            .into());
        }

        let timing = self.timing(stream)?;
        let analyzer = NoiseAnalyzer::try_new(NoiseAnalyzerConfig {
            sample_rate: timing.sample_rate,
            binning: LogBinConfig {
                n_bins: self.config.noise.n_bins,
                f_min: self.config.noise.f_min,
                f_max: self.config.noise.f_max,
            },
            welch_nperseg: self.config.noise.welch_nperseg,
        })?;
        let windowing = Windowing::from_sweep(fine);

        let mut channels = self.fan_out(nch, |ch| {
            self.process_channel(ch, (fine, gain, stream), &windowing, &timing, &analyzer)
        })?;

        let pca_eigenvalues = if self.config.n_comp_pca > 0 {
            self.pca_barrier(&mut channels, &analyzer)?
        } else {
            None
        };

        let output = BatchOutput {
            channels,
            sample_rate: timing.sample_rate,
            pca_eigenvalues,
        };
        info!(
            channels = nch,
            ok = output.count(ChannelStatus::Ok),
            fit_failed = output.count(ChannelStatus::FitFailed),
            bad_chi_squared = output.count(ChannelStatus::BadChiSquared),
            windowing_degenerate = output.count(ChannelStatus::WindowingDegenerate),
            calibration_failed = output.count(ChannelStatus::CalibrationFailed),
            "batch complete"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitConfig;
    use crate::synth::ScenarioConfig;
    use core::f64::consts::PI;
    use ndarray::Array2;

    fn config() -> PipelineConfig {
        PipelineConfig {
            phase_limit: 0.95 * PI,
            workers: Some(2),
            ..Default::default()
        }
    }

    fn short_scenario() -> ScenarioConfig {
        ScenarioConfig {
            n_samples: 1024,
            ..Default::default()
        }
    }

    fn rebuild(rec: &SweepRecord, zero_channel: usize) -> SweepRecord {
        let cols: Vec<(Vec<f64>, Vec<num_complex::Complex64>)> =
            (0..rec.n_channels()).map(|ch| (rec.freqs(ch), rec.z(ch))).collect();
        let shape = (rec.n_points(), rec.n_channels());
        let freqs = Array2::from_shape_fn(shape, |(k, ch)| cols[ch].0[k]);
        let part = |im: bool| {
            Array2::from_shape_fn(shape, |(k, ch)| match (ch == zero_channel, im) {
                (true, _) => 0.0,
                (false, false) => cols[ch].1[k].re,
                (false, true) => cols[ch].1[k].im,
            })
        };
        SweepRecord::try_new(freqs, part(false), part(true)).expect("valid sweep")
    }

    #[test]
    fn channel_count_mismatch_is_fatal() {
        let s = short_scenario().generate().expect("scenario");
        let two = ScenarioConfig {
            resonators: short_scenario().resonators[..2].to_vec(),
            ..short_scenario()
        }
        .generate()
        .expect("scenario");
        let pipeline = Pipeline::try_new(config()).expect("valid");
        let err = pipeline.run(&s.fine, &two.gain, &s.stream).expect_err("mismatch");
        assert!(matches!(
            err,
            PipelineError::ShapeMismatch {
                what: "gain sweep channels",
                expected: 3,
                got: 2
            }
        ));
    }

    #[test]
    fn too_many_pca_components_is_a_config_error() {
        let s = short_scenario().generate().expect("scenario");
        let pipeline = Pipeline::try_new(PipelineConfig {
            n_comp_pca: 3,
            ..config()
        })
        .expect("valid");
        let err = pipeline.run(&s.fine, &s.gain, &s.stream).expect_err("config");
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn a_broken_channel_does_not_affect_the_others() {
        let s = short_scenario().generate().expect("scenario");
        let gain = rebuild(&s.gain, 1);
        let pipeline = Pipeline::try_new(PipelineConfig {
            fit_resonators: false,
            ..config()
        })
        .expect("valid");
        let out = pipeline.run(&s.fine, &gain, &s.stream).expect("batch");
        assert_eq!(out.channels.len(), 3);
        assert_eq!(out.channels[1].status, ChannelStatus::CalibrationFailed);
        assert!(out.channels[1].calibration.is_none());
        for ch in [0, 2] {
            assert_eq!(out.channels[ch].channel, ch);
            assert_eq!(out.channels[ch].status, ChannelStatus::Ok);
            assert!(out.channels[ch].noise.is_some());
            assert!(out.channels[ch].fit.is_none());
        }
    }

    #[test]
    fn pca_attaches_clean_spectra() {
        let s = short_scenario().generate().expect("scenario");
        let pipeline = Pipeline::try_new(PipelineConfig {
            fit_resonators: false,
            n_comp_pca: 1,
            bin_num: Some(2),
            ..config()
        })
        .expect("valid");
        let out = pipeline.run(&s.fine, &s.gain, &s.stream).expect("batch");
        assert_eq!(out.sample_rate, 488.281_25 / 2.0);
        assert_eq!(out.pca_eigenvalues.as_ref().map(Vec::len), Some(3));
        for report in &out.channels {
            let noise = report.noise.as_ref().expect("noise");
            assert!(noise.sxx_clean.is_some());
            let rec = report.calibration.as_ref().expect("calibration");
            assert_eq!(rec.stream_df_over_f.len(), 512);
        }
    }

    // relabel each channel's sweep frequencies by `shifts[ch]`, keeping the samples
    fn shifted(rec: &SweepRecord, shifts: &[f64]) -> SweepRecord {
        let shape = (rec.n_points(), rec.n_channels());
        let freqs: Vec<Vec<f64>> = (0..shape.1).map(|ch| rec.freqs(ch)).collect();
        let z: Vec<Vec<num_complex::Complex64>> = (0..shape.1).map(|ch| rec.z(ch)).collect();
        SweepRecord::try_new(
            Array2::from_shape_fn(shape, |(k, ch)| freqs[ch][k] + shifts[ch]),
            Array2::from_shape_fn(shape, |(k, ch)| z[ch][k].re),
            Array2::from_shape_fn(shape, |(k, ch)| z[ch][k].im),
        )
        .expect("valid sweep")
    }

    #[test]
    fn fits_above_the_cutoff_are_flagged_but_kept() {
        let s = short_scenario().generate().expect("scenario");
        let pipeline = Pipeline::try_new(PipelineConfig {
            reduced_chi_squared_cutoff: 1e-30,
            ..config()
        })
        .expect("valid");
        let out = pipeline.run(&s.fine, &s.gain, &s.stream).expect("batch");
        assert_eq!(out.count(ChannelStatus::BadChiSquared), 3);
        for report in &out.channels {
            let fit = report.fit.as_ref().expect("fit reported");
            assert!(!fit.is_failed());
            assert!(fit.reduced_chi_squared > 1e-30);
            assert!(report.detail.as_deref().is_some_and(|d| d.contains("cutoff")));
            assert!(report.calibration.is_some());
            assert!(report.noise.is_some());
        }
    }

    #[test]
    fn failed_fits_become_the_zero_vector() {
        let s = short_scenario().generate().expect("scenario");
        let pipeline = Pipeline::try_new(PipelineConfig {
            fit: FitConfig {
                max_iterations: 1,
                ..Default::default()
            },
            ..config()
        })
        .expect("valid");
        let out = pipeline.run(&s.fine, &s.gain, &s.stream).expect("batch");
        assert_eq!(out.count(ChannelStatus::FitFailed), 3);
        for report in &out.channels {
            let fit = report.fit.as_ref().expect("fit reported");
            assert!(fit.is_failed());
            assert_eq!(fit.reduced_chi_squared, 0.0);
            assert!(report.detail.as_deref().is_some_and(|d| d.contains("converge")));
            assert!(report.calibration.is_some());
        }
    }

    #[test]
    fn a_squeezed_window_only_degrades_its_own_channel() {
        let s = short_scenario().generate().expect("scenario");
        // neighbours 4 kHz either side of channel 1, inside one fine step
        let c1 = s.fine.centre(1);
        let shifts = [c1 - 4.0e3 - s.fine.centre(0), 0.0, c1 + 4.0e3 - s.fine.centre(2)];
        let fine = shifted(&s.fine, &shifts);
        let pipeline = Pipeline::try_new(config()).expect("valid");
        let out = pipeline.run(&fine, &s.gain, &s.stream).expect("batch");

        let squeezed = &out.channels[1];
        assert_eq!(squeezed.status, ChannelStatus::WindowingDegenerate);
        assert!(squeezed.fit.as_ref().is_some_and(FitResult::is_failed));
        assert!(squeezed.detail.is_some());
        assert!(squeezed.calibration.is_some());
        for ch in [0, 2] {
            assert_eq!(out.channels[ch].channel, ch);
            assert_ne!(out.channels[ch].status, ChannelStatus::WindowingDegenerate);
        }
    }

    #[test]
    fn oversized_bin_num_names_the_bin_argument() {
        let s = ScenarioConfig {
            n_samples: 16,
            ..Default::default()
        }
        .generate()
        .expect("scenario");
        let pipeline = Pipeline::try_new(PipelineConfig {
            bin_num: Some(32),
            ..config()
        })
        .expect("valid");
        let err = pipeline.run(&s.fine, &s.gain, &s.stream).expect_err("nothing left");
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::InvalidArgument { arg: "bin_num", .. })
        ));
    }
}
