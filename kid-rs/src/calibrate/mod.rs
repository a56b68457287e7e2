//! Per-channel IQ calibration: gain normalization, cable-delay removal,
//! resonance-circle fit, recentring and phase to fractional frequency.

mod interp;
mod stream;

pub use interp::PhaseToFrequency;
pub use stream::{StreamPreprocessor, StreamPreprocessorConfig, StreamTiming};

use crate::error::CalibrationError;
use crate::kernel::{ConfigError, KernelLifecycle};
use crate::linalg::{Circle, CircleFitConfig, CircleFitKernel};
use crate::resonator::guess::cable_delay;
use crate::stats::{circular_median_phase, nanmean};
use core::f64::consts::{FRAC_PI_2, PI};
use kid_rs_core::num_rs::Polynomial;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One channel's sweeps as seen by the calibrator.
///
/// `gain_fit` marks the gain points usable for the normalization and
/// delay fits, i.e. those away from every resonance.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSweeps {
    /// Fine-sweep frequencies, Hz.
    pub fine_freqs: Vec<f64>,
    /// Fine-sweep samples.
    pub fine_z: Vec<Complex64>,
    /// Gain-sweep frequencies, Hz.
    pub gain_freqs: Vec<f64>,
    /// Gain-sweep samples.
    pub gain_z: Vec<Complex64>,
    /// Off-resonance mask over the gain sweep.
    pub gain_fit: Vec<bool>,
    /// Readout tone frequency of the stream, Hz.
    pub tone_freq: f64,
}

/// Constructor config for [`ChannelCalibrator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibratorConfig {
    /// Order of the `|gain|` normalization polynomial.
    pub gain_poly_order: usize,
    /// Rotate so the first fine point sits at phase `pi` instead of putting
    /// the stream median at phase 0.
    pub rotate_fine_first: bool,
    /// Fine points with `|phase| >= phase_limit` are left out of the
    /// phase to frequency map.
    pub phase_limit: f64,
    /// Circle fit settings.
    pub circle: CircleFitConfig,
}

impl Default for ChannelCalibratorConfig {
    fn default() -> Self {
        Self {
            gain_poly_order: 2,
            rotate_fine_first: false,
            phase_limit: FRAC_PI_2,
            circle: CircleFitConfig::default(),
        }
    }
}

/// The frozen transform derived by a calibration, applicable to further
/// stream captures of the same tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// `|gain|` normalization polynomial.
    pub gain_poly: Polynomial,
    /// Cable delay, s.
    pub tau: f64,
    /// Fitted circle after normalization and delay removal.
    pub circle: Circle,
    /// Rotation applied after centring, rad.
    pub theta: f64,
    /// Phase to frequency map.
    pub interpolant: PhaseToFrequency,
    /// Readout tone frequency, Hz.
    pub tone_freq: f64,
}

/// A stream mapped through [`CalibrationParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedStream {
    /// Centred and rotated samples.
    pub corr: Vec<Complex64>,
    /// Fractional frequency shift; `NaN` outside the interpolant domain.
    pub df_over_f: Vec<f64>,
    /// Number of `NaN` samples in `df_over_f`.
    pub out_of_domain: usize,
}

fn delay_rotation(f: f64, tau: f64) -> Complex64 {
    Complex64::from_polar(1.0, 2.0 * PI * f * tau)
}

/// Normalize, remove the delay, centre and rotate.
fn correct(z: Complex64, f: f64, scale: f64, tau: f64, centre: Complex64, theta: f64) -> Complex64 {
    (z / scale * delay_rotation(f, tau) - centre) * Complex64::from_polar(1.0, -theta)
}

impl CalibrationParams {
    fn correct(&self, f: f64, z: Complex64, scale: f64) -> Complex64 {
        correct(z, f, scale, self.tau, self.circle.centre(), self.theta)
    }

    /// Correct stream samples and map their phase to `df/f`.
    pub fn apply(&self, stream: &[Complex64]) -> Result<CalibratedStream, CalibrationError> {
        let scale = self.gain_poly.eval(self.tone_freq);
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CalibrationError::Degenerate {
                stage: "amplitude normalization",
                reason: "gain polynomial is not positive at the tone frequency",
            });
        }
        let corr: Vec<Complex64> = stream
            .iter()
            .map(|z| self.correct(self.tone_freq, *z, scale))
            .collect();

        let freqs: Vec<f64> = corr
            .iter()
            .map(|z| self.interpolant.eval(z.arg()).unwrap_or(f64::NAN))
            .collect();
        let out_of_domain = freqs.iter().filter(|f| f.is_nan()).count();
        let (mean, n) = nanmean(freqs.iter());
        if n == 0 {
            return Err(CalibrationError::Degenerate {
                stage: "phase to frequency",
                reason: "every stream phase lies outside the interpolant domain",
            });
        }
        if out_of_domain > 0 {
            warn!(
                out_of_domain,
                total = corr.len(),
                "stream phases outside the fine-sweep phase range mapped to NaN"
            );
        }
        let df_over_f = freqs.iter().map(|f| f / mean - 1.0).collect();
        Ok(CalibratedStream {
            corr,
            df_over_f,
            out_of_domain,
        })
    }
}

/// Everything produced by calibrating one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Raw fine-sweep samples.
    pub fine_z: Vec<Complex64>,
    /// Raw gain-sweep samples.
    pub gain_z: Vec<Complex64>,
    /// Preprocessed raw stream samples.
    pub stream_z: Vec<Complex64>,
    /// Fine-sweep frequencies.
    pub fine_freqs: Vec<f64>,
    /// Gain-sweep frequencies.
    pub gain_freqs: Vec<f64>,
    /// Corrected stream.
    pub stream_corr: Vec<Complex64>,
    /// Corrected gain sweep.
    pub gain_corr: Vec<Complex64>,
    /// Corrected fine sweep.
    pub fine_corr: Vec<Complex64>,
    /// Fractional frequency shift of the stream.
    pub stream_df_over_f: Vec<f64>,
    /// Packet-counter time axis, s.
    pub time: Vec<f64>,
    /// Sample-index time axis, s.
    pub stream_time: Vec<f64>,
    /// Stream sample rate after averaging, Hz.
    pub sample_rate: f64,
    /// Circle centre, real part.
    pub xc: f64,
    /// Circle centre, imaginary part.
    pub yc: f64,
    /// Circle radius.
    pub r: f64,
    /// Cable delay, s.
    pub tau: f64,
    /// Rotation applied after centring, rad.
    pub med_phase: f64,
    /// `|gain|` normalization polynomial.
    pub gain_poly: Polynomial,
    /// Phase to frequency map.
    pub interpolant: PhaseToFrequency,
    /// `NaN` count in `stream_df_over_f`.
    pub out_of_domain: usize,
    /// Readout tone frequency, Hz.
    pub tone_freq: f64,
}

impl CalibrationRecord {
    /// The frozen transform behind this record.
    pub fn params(&self) -> CalibrationParams {
        CalibrationParams {
            gain_poly: self.gain_poly.clone(),
            tau: self.tau,
            circle: Circle {
                xc: self.xc,
                yc: self.yc,
                r: self.r,
            },
            theta: self.med_phase,
            interpolant: self.interpolant.clone(),
            tone_freq: self.tone_freq,
        }
    }
}

/// Sequential per-channel calibration.
///
/// ```
/// use kid_rs::calibrate::{ChannelCalibrator, ChannelCalibratorConfig};
/// use kid_rs::kernel::KernelLifecycle;
///
/// let cfg = ChannelCalibratorConfig { phase_limit: 0.0, ..Default::default() };
/// assert!(ChannelCalibrator::try_new(cfg).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibrator {
    gain_poly_order: usize,
    rotate_fine_first: bool,
    phase_limit: f64,
    circle: CircleFitKernel,
}

impl KernelLifecycle for ChannelCalibrator {
    type Config = ChannelCalibratorConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        if !(config.phase_limit > 0.0 && config.phase_limit < PI) {
            return Err(ConfigError::InvalidArgument {
                arg: "phase_limit",
                reason: "phase_limit must lie in (0, pi)",
            });
        }
        Ok(Self {
            gain_poly_order: config.gain_poly_order,
            rotate_fine_first: config.rotate_fine_first,
            phase_limit: config.phase_limit,
            circle: CircleFitKernel::try_new(config.circle)?,
        })
    }
}

fn masked<T: Copy>(values: &[T], mask: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|(v, _)| *v)
        .collect()
}

impl ChannelCalibrator {
    /// Prefer the off-resonance gain points when enough of them exist.
    fn fit_subset(&self, sweeps: &ChannelSweeps, min: usize) -> (Vec<f64>, Vec<Complex64>) {
        let freqs = masked(&sweeps.gain_freqs, &sweeps.gain_fit);
        if freqs.len() >= min {
            (freqs, masked(&sweeps.gain_z, &sweeps.gain_fit))
        } else {
            (sweeps.gain_freqs.clone(), sweeps.gain_z.clone())
        }
    }

    fn gain_polynomial(&self, sweeps: &ChannelSweeps) -> Result<Polynomial, CalibrationError> {
        let (freqs, z) = self.fit_subset(sweeps, self.gain_poly_order + 2);
        let mags: Vec<f64> = z.iter().map(|v| v.norm()).collect();
        let poly = Polynomial::fit(&freqs, &mags, self.gain_poly_order)?;
        let positive = sweeps
            .fine_freqs
            .iter()
            .chain(&sweeps.gain_freqs)
            .chain(core::iter::once(&sweeps.tone_freq))
            .map(|f| poly.eval(*f))
            .all(|g| g.is_finite() && g > 0.0);
        if !positive {
            return Err(CalibrationError::Degenerate {
                stage: "amplitude normalization",
                reason: "gain polynomial is not positive over the sweep",
            });
        }
        Ok(poly)
    }

    fn delay(&self, sweeps: &ChannelSweeps, poly: &Polynomial) -> Result<f64, CalibrationError> {
        let (freqs, z) = self.fit_subset(sweeps, 3);
        let normalized: Vec<Complex64> = freqs.iter().zip(&z).map(|(f, v)| v / poly.eval(*f)).collect();
        cable_delay(&freqs, &normalized).ok_or(CalibrationError::Degenerate {
            stage: "cable delay",
            reason: "gain phase slope could not be fitted",
        })
    }

    /// Calibrate one channel against its preprocessed stream.
    pub fn calibrate(
        &self,
        sweeps: &ChannelSweeps,
        stream: Vec<Complex64>,
        timing: StreamTiming,
    ) -> Result<CalibrationRecord, CalibrationError> {
        if sweeps.gain_freqs.len() != sweeps.gain_z.len() || sweeps.gain_fit.len() != sweeps.gain_z.len() {
            return Err(CalibrationError::Degenerate {
                stage: "input",
                reason: "gain frequencies, samples and mask differ in length",
            });
        }
        if sweeps.fine_freqs.len() != sweeps.fine_z.len() {
            return Err(CalibrationError::Degenerate {
                stage: "input",
                reason: "fine frequencies and samples differ in length",
            });
        }

        let gain_poly = self.gain_polynomial(sweeps)?;
        let tau = self.delay(sweeps, &gain_poly)?;
        debug!(tau, "cable delay");

        let fine_delayed: Vec<Complex64> = sweeps
            .fine_freqs
            .iter()
            .zip(&sweeps.fine_z)
            .map(|(f, z)| z / gain_poly.eval(*f) * delay_rotation(*f, tau))
            .collect();
        let circle = self.circle.run(&fine_delayed[..])?;
        if !(circle.r.is_finite() && circle.r > 0.0) {
            return Err(CalibrationError::Degenerate {
                stage: "circle fit",
                reason: "fitted radius is not positive",
            });
        }
        debug!(xc = circle.xc, yc = circle.yc, r = circle.r, "resonance circle");

        let theta = if self.rotate_fine_first {
            (fine_delayed[0] - circle.centre()).arg() + PI
        } else {
            let scale = gain_poly.eval(sweeps.tone_freq);
            let centred: Vec<Complex64> = stream
                .iter()
                .map(|z| z / scale * delay_rotation(sweeps.tone_freq, tau) - circle.centre())
                .collect();
            circular_median_phase(&centred).ok_or(CalibrationError::Degenerate {
                stage: "rotation",
                reason: "stream is empty",
            })?
        };

        let correct_sweep = |freqs: &[f64], z: &[Complex64]| -> Vec<Complex64> {
            freqs
                .iter()
                .zip(z)
                .map(|(f, v)| correct(*v, *f, gain_poly.eval(*f), tau, circle.centre(), theta))
                .collect()
        };
        let fine_corr = correct_sweep(&sweeps.fine_freqs, &sweeps.fine_z);
        let gain_corr = correct_sweep(&sweeps.gain_freqs, &sweeps.gain_z);
        let fine_phase: Vec<f64> = fine_corr.iter().map(|z| z.arg()).collect();
        let interpolant = PhaseToFrequency::try_new(&fine_phase, &sweeps.fine_freqs, self.phase_limit)?;

        let params = CalibrationParams {
            gain_poly,
            tau,
            circle,
            theta,
            interpolant,
            tone_freq: sweeps.tone_freq,
        };
        let calibrated = params.apply(&stream)?;
        debug!(
            theta,
            out_of_domain = calibrated.out_of_domain,
            "stream mapped to df/f"
        );

        Ok(CalibrationRecord {
            fine_z: sweeps.fine_z.clone(),
            gain_z: sweeps.gain_z.clone(),
            stream_z: stream,
            fine_freqs: sweeps.fine_freqs.clone(),
            gain_freqs: sweeps.gain_freqs.clone(),
            stream_corr: calibrated.corr,
            gain_corr,
            fine_corr,
            stream_df_over_f: calibrated.df_over_f,
            time: timing.time,
            stream_time: timing.stream_time,
            sample_rate: timing.sample_rate,
            xc: params.circle.xc,
            yc: params.circle.yc,
            r: params.circle.r,
            tau,
            med_phase: theta,
            gain_poly: params.gain_poly,
            interpolant: params.interpolant,
            out_of_domain: calibrated.out_of_domain,
            tone_freq: sweeps.tone_freq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resonator::window::Windowing;
    use crate::synth::ScenarioConfig;
    use approx::assert_relative_eq;

    fn scenario() -> ScenarioConfig {
        let base = ScenarioConfig::default();
        ScenarioConfig {
            resonators: vec![base.resonators[0]],
            n_samples: 1024,
            ..base
        }
    }

    fn calibrator() -> ChannelCalibrator {
        ChannelCalibrator::try_new(ChannelCalibratorConfig {
            phase_limit: 0.95 * PI,
            ..Default::default()
        })
        .expect("valid")
    }

    fn channel(cfg: &ScenarioConfig) -> (ChannelSweeps, Vec<Complex64>, StreamTiming) {
        let s = cfg.generate().expect("scenario");
        let windows = Windowing::from_sweep(&s.fine);
        let gain_freqs = s.gain.freqs(0);
        let sweeps = ChannelSweeps {
            fine_freqs: s.fine.freqs(0),
            fine_z: s.fine.z(0),
            gain_fit: gain_freqs.iter().map(|f| !windows.near_any_resonance(*f)).collect(),
            gain_freqs,
            gain_z: s.gain.z(0),
            tone_freq: s.stream.tone_freq(0).expect("tone"),
        };
        let pre = StreamPreprocessor::try_new(StreamPreprocessorConfig::default()).expect("valid");
        let stream = pre.samples(&s.stream.z(0)).expect("stream");
        let timing = pre
            .timing(s.stream.packet_count(), s.stream.sample_rate())
            .expect("timing");
        (sweeps, stream, timing)
    }

    #[test]
    fn recovers_cable_delay_and_circle() {
        let cfg = scenario();
        let (sweeps, stream, timing) = channel(&cfg);
        let rec = calibrator().calibrate(&sweeps, stream, timing).expect("calibrated");
        assert_relative_eq!(rec.tau, cfg.readout.cable_delay, max_relative = 3e-2);
        assert_relative_eq!(rec.r, cfg.resonators[0].amp / 2.0, max_relative = 2e-2);
        let phases: Vec<f64> = rec.stream_corr.iter().map(|z| z.arg()).collect();
        let (median_phase, _) = crate::stats::median::<_, f64>(phases.iter());
        assert!(median_phase.abs() < 1e-9);
    }

    #[test]
    fn df_over_f_follows_the_injected_shift() {
        let cfg = scenario();
        let (sweeps, stream, timing) = channel(&cfg);
        let rec = calibrator().calibrate(&sweeps, stream, timing).expect("calibrated");
        assert_eq!(rec.out_of_domain, 0);
        let signal = cfg.signal();
        let mean = signal.iter().sum::<f64>() / signal.len() as f64;
        for (got, x) in rec.stream_df_over_f.iter().zip(&signal) {
            assert!((got + (x - mean)).abs() < 5e-6, "df/f {got} vs shift {x}");
        }
        assert_eq!(rec.time.len(), rec.stream_df_over_f.len());
    }

    #[test]
    fn frozen_params_reproduce_the_record() {
        let (sweeps, stream, timing) = channel(&scenario());
        let rec = calibrator().calibrate(&sweeps, stream, timing).expect("calibrated");
        let again = rec.params().apply(&rec.stream_z).expect("applied");
        assert_eq!(again.corr, rec.stream_corr);
        assert_eq!(again.out_of_domain, rec.out_of_domain);
        for (a, b) in again.df_over_f.iter().zip(&rec.stream_df_over_f) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn off_resonance_stream_samples_become_nan() {
        let cfg = scenario();
        let (sweeps, mut stream, timing) = channel(&cfg);
        stream.push(cfg.readout.apply(sweeps.tone_freq, Complex64::new(1.0, 0.0)));
        let rec = calibrator().calibrate(&sweeps, stream, timing).expect("calibrated");
        assert_eq!(rec.out_of_domain, 1);
        assert!(rec.stream_df_over_f.last().is_some_and(|v| v.is_nan()));
        assert!(rec.stream_df_over_f[0].is_finite());
    }

    #[test]
    fn rotate_fine_first_puts_first_point_at_pi() {
        let (sweeps, stream, timing) = channel(&scenario());
        let cal = ChannelCalibrator::try_new(ChannelCalibratorConfig {
            rotate_fine_first: true,
            phase_limit: 0.95 * PI,
            ..Default::default()
        })
        .expect("valid");
        let rec = cal.calibrate(&sweeps, stream, timing).expect("calibrated");
        assert_relative_eq!(rec.fine_corr[0].arg().abs(), PI, epsilon = 1e-9);
    }

    #[test]
    fn dead_gain_sweep_is_degenerate() {
        let (mut sweeps, stream, timing) = channel(&scenario());
        sweeps.gain_z.iter_mut().for_each(|z| *z = Complex64::new(0.0, 0.0));
        let err = calibrator().calibrate(&sweeps, stream, timing).expect_err("degenerate");
        assert!(matches!(err, CalibrationError::Degenerate { .. }));
    }

    #[test]
    fn phase_limit_bound_matches_the_pipeline_config() {
        for limit in [PI, 0.0, -1.0] {
            let cal = ChannelCalibrator::try_new(ChannelCalibratorConfig {
                phase_limit: limit,
                ..Default::default()
            });
            let cfg = crate::config::PipelineConfig {
                phase_limit: limit,
                ..Default::default()
            };
            assert!(cal.is_err(), "calibrator accepted {limit}");
            assert!(cfg.validate().is_err(), "config accepted {limit}");
        }
        assert!(ChannelCalibrator::try_new(ChannelCalibratorConfig {
            phase_limit: 0.999 * PI,
            ..Default::default()
        })
        .is_ok());
    }
}
