//! Synthetic readout data: swept and streamed nonlinear resonators seen
//! through a readout chain with gain ripple, cable delay and white noise.

use crate::error::PipelineError;
use crate::kernel::ConfigError;
use crate::records::{StreamRecord, SweepRecord};
use crate::resonator::bifurcation::{detuning, generator_detuning, transmission};
use core::f64::consts::PI;
use ndarray::Array2;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// True parameters of one simulated resonator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthResonator {
    /// Resonance frequency, Hz.
    pub fr: f64,
    /// Loaded quality factor.
    pub qr: f64,
    /// Dip depth.
    pub amp: f64,
    /// Asymmetry angle, rad.
    pub phi: f64,
    /// Nonlinearity.
    pub a: f64,
}

impl SynthResonator {
    /// Normalized transmission at `f`.
    pub fn s21(&self, f: f64) -> Complex64 {
        self.s21_with_fr(f, self.fr)
    }

    /// Normalized transmission at `f` with the resonance moved to `fr`.
    pub fn s21_with_fr(&self, f: f64, fr: f64) -> Complex64 {
        transmission(detuning(generator_detuning(f, fr, self.qr), self.a), self.amp, self.phi)
    }
}

/// Readout chain between the resonators and the digitizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    /// Gain magnitude at `reference`.
    pub gain: f64,
    /// Fractional slope of `|gain|^2` in `(f - reference) / reference`.
    pub gain_slope: f64,
    /// Cable delay, s.
    pub cable_delay: f64,
    /// Constant phase offset, rad.
    pub phase: f64,
    /// Reference frequency of the gain slope, Hz.
    pub reference: f64,
}

impl Readout {
    /// `s21` as digitized at frequency `f`.
    pub fn apply(&self, f: f64, s21: Complex64) -> Complex64 {
        let xlin = (f - self.reference) / self.reference;
        let mag = self.gain * (1.0 + self.gain_slope * xlin).max(0.0).sqrt();
        s21 * Complex64::from_polar(mag, self.phase - 2.0 * PI * f * self.cable_delay)
    }
}

/// Scenario description. The default is a three-tone array with a 1 Hz,
/// `1e-4` fractional-frequency modulation, sampled at 488.28125 Hz for 10 s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// One resonator per channel; tones sit on the unmodulated `fr`.
    pub resonators: Vec<SynthResonator>,
    /// Readout chain.
    pub readout: Readout,
    /// Half span of each fine sweep, Hz.
    pub fine_half_span: f64,
    /// Points per fine sweep.
    pub fine_points: usize,
    /// Half span of each gain sweep, Hz.
    pub gain_half_span: f64,
    /// Points per gain sweep.
    pub gain_points: usize,
    /// Per-quadrature white noise on the sweeps.
    pub sweep_noise: f64,
    /// Per-quadrature white noise on the stream.
    pub stream_noise: f64,
    /// Stream sample rate, Hz.
    pub sample_rate: f64,
    /// Stream length in samples.
    pub n_samples: usize,
    /// Peak fractional frequency shift of the injected tone.
    pub signal_amplitude: f64,
    /// Frequency of the injected tone, Hz.
    pub signal_freq: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        let resonator = |fr| SynthResonator {
            fr,
            qr: 2.0e4,
            amp: 0.3,
            phi: 0.0,
            a: 0.1,
        };
        Self {
            resonators: vec![resonator(4.000e9), resonator(4.010e9), resonator(4.021e9)],
            readout: Readout {
                gain: 1.0,
                gain_slope: 20.0,
                cable_delay: 30e-9,
                phase: 0.7,
                reference: 4.0e9,
            },
            fine_half_span: 1.5e6,
            fine_points: 501,
            gain_half_span: 5.0e6,
            gain_points: 201,
            sweep_noise: 2e-4,
            stream_noise: 1e-4,
            sample_rate: 488.281_25,
            n_samples: 4882,
            signal_amplitude: 1e-4,
            signal_freq: 1.0,
            seed: 7,
        }
    }
}

/// Generated records together with the injected signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    /// Fine sweep centred on each resonance.
    pub fine: SweepRecord,
    /// Wide gain sweep around each resonance.
    pub gain: SweepRecord,
    /// Stream capture with tone frequencies attached.
    pub stream: StreamRecord,
    /// Injected fractional frequency shift `x(t)`, common to all channels.
    pub signal: Vec<f64>,
}

fn white(sigma: f64) -> Result<Normal<f64>, PipelineError> {
    Normal::new(0.0, sigma).map_err(|_| {
        ConfigError::InvalidArgument {
            arg: "noise",
            reason: "noise level must be finite and >= 0",
        }
        .into()
    })
}

impl ScenarioConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.resonators.is_empty() {
            return Err(ConfigError::EmptyInput { arg: "resonators" });
        }
        if self.fine_points < 3 || self.gain_points < 3 {
            return Err(ConfigError::InvalidArgument {
                arg: "points",
                reason: "sweeps need at least three points",
            });
        }
        if self.n_samples == 0 {
            return Err(ConfigError::EmptyInput { arg: "n_samples" });
        }
        Ok(())
    }

    /// Injected `x(t) = A sin(2 pi f t)`.
    pub fn signal(&self) -> Vec<f64> {
        (0..self.n_samples)
            .map(|k| {
                let t = k as f64 / self.sample_rate;
                self.signal_amplitude * (2.0 * PI * self.signal_freq * t).sin()
            })
            .collect()
    }

    fn sweep(&self, rng: &mut StdRng, half_span: f64, npts: usize) -> Result<SweepRecord, PipelineError> {
        let nch = self.resonators.len();
        let noise = white(self.sweep_noise)?;
        let freqs = Array2::from_shape_fn((npts, nch), |(k, ch)| {
            self.resonators[ch].fr - half_span + 2.0 * half_span * k as f64 / (npts - 1) as f64
        });
        let mut i = Array2::zeros((npts, nch));
        let mut q = Array2::zeros((npts, nch));
        for ((k, ch), f) in freqs.indexed_iter() {
            let z = self.readout.apply(*f, self.resonators[ch].s21(*f));
            i[[k, ch]] = z.re + noise.sample(rng);
            q[[k, ch]] = z.im + noise.sample(rng);
        }
        let record = SweepRecord::try_new(freqs, i, q)?;
        if self.sweep_noise > 0.0 {
            let std = Array2::from_elem((npts, nch), self.sweep_noise);
            record.with_std(std.clone(), std)
        } else {
            Ok(record)
        }
    }

    /// One stream capture of the configured signal with its own noise draw.
    pub fn capture(&self, seed: u64) -> Result<StreamRecord, PipelineError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = white(self.stream_noise)?;
        let signal = self.signal();
        let nch = self.resonators.len();
        let mut i = Array2::zeros((self.n_samples, nch));
        let mut q = Array2::zeros((self.n_samples, nch));
        for (ch, res) in self.resonators.iter().enumerate() {
            for (k, x) in signal.iter().enumerate() {
                let z = self.readout.apply(res.fr, res.s21_with_fr(res.fr, res.fr * (1.0 + x)));
                i[[k, ch]] = z.re + noise.sample(&mut rng);
                q[[k, ch]] = z.im + noise.sample(&mut rng);
            }
        }
        let packet_count = (0..self.n_samples as u64).collect();
        StreamRecord::try_new(i, q, packet_count, self.sample_rate)?
            .with_tone_freqs(self.resonators.iter().map(|r| r.fr).collect())
    }

    /// Generate the sweeps and one stream capture.
    pub fn generate(&self) -> Result<Scenario, PipelineError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let fine = self.sweep(&mut rng, self.fine_half_span, self.fine_points)?;
        let gain = self.sweep(&mut rng, self.gain_half_span, self.gain_points)?;
        let stream = self.capture(self.seed.wrapping_add(1))?;
        Ok(Scenario {
            fine,
            gain,
            stream,
            signal: self.signal(),
        })
    }
}
