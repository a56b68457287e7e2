//! One-sided power spectral densities analogous to `scipy.signal` spectral APIs.

use crate::kernel::{ConfigError, ExecInvariantViolation, KernelLifecycle, Read1D, Write1D};
use crate::signal::traits::{Periodogram1D, WelchPsd1D};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

fn hann_window(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }
    // periodic Hann, as used by scipy's spectral estimators
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * core::f64::consts::PI * i as f64 / n as f64).cos())
        .collect()
}

fn rfft_real(fft: &Arc<dyn Fft<f64>>, x: &[f64]) -> Vec<Complex<f64>> {
    let mut buf: Vec<Complex<f64>> = x.iter().map(|v| Complex::new(*v, 0.0)).collect();
    buf.resize(fft.len(), Complex::new(0.0, 0.0));
    fft.process(&mut buf);
    buf
}

fn onesided_freqs(nfft: usize, fs: f64) -> Vec<f64> {
    let n_freq = nfft / 2 + 1;
    (0..n_freq).map(|k| k as f64 * fs / nfft as f64).collect()
}

fn onesided_psd(spectrum: &[Complex<f64>], fs: f64, norm: f64) -> Vec<f64> {
    let nfft = spectrum.len();
    let n_freq = nfft / 2 + 1;
    let mut pxx = vec![0.0; n_freq];
    for (k, p) in pxx.iter_mut().enumerate() {
        let mut v = spectrum[k].norm_sqr() / (fs * norm);
        if k != 0 && !(nfft % 2 == 0 && k == nfft / 2) {
            v *= 2.0;
        }
        *p = v;
    }
    pxx
}

fn detrend_constant(x: &[f64]) -> Vec<f64> {
    let avg = x.iter().sum::<f64>() / x.len() as f64;
    x.iter().map(|v| v - avg).collect()
}

fn segment_starts(len: usize, nperseg: usize, noverlap: usize) -> Vec<usize> {
    if nperseg == 0 || noverlap >= nperseg {
        return Vec::new();
    }
    if len <= nperseg {
        return vec![0];
    }
    let hop = nperseg - noverlap;
    let mut starts = Vec::new();
    let mut start = 0usize;
    while start + nperseg <= len {
        starts.push(start);
        start += hop;
    }
    starts
}

fn periodogram_impl(x: &[f64], fs: f64) -> (Vec<f64>, Vec<f64>) {
    if x.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let nfft = x.len();
    let fft = FftPlanner::<f64>::new().plan_fft_forward(nfft);
    let spectrum = rfft_real(&fft, &detrend_constant(x));
    (onesided_freqs(nfft, fs), onesided_psd(&spectrum, fs, nfft as f64))
}

fn welch_impl(x: &[f64], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    if x.is_empty() || nperseg == 0 {
        return (Vec::new(), Vec::new());
    }
    let nperseg = nperseg.min(x.len());
    let starts = segment_starts(x.len(), nperseg, nperseg / 2);
    let window = hann_window(nperseg);
    let win_norm = window.iter().map(|v| v * v).sum::<f64>();
    let fft = FftPlanner::<f64>::new().plan_fft_forward(nperseg);
    let mut accum = vec![0.0; nperseg / 2 + 1];

    for &start in &starts {
        let segment = detrend_constant(&x[start..start + nperseg]);
        let windowed: Vec<f64> = segment
            .iter()
            .zip(window.iter())
            .map(|(s, w)| s * w)
            .collect();
        let psd = onesided_psd(&rfft_real(&fft, &windowed), fs, win_norm);
        for (a, p) in accum.iter_mut().zip(psd.iter()) {
            *a += *p;
        }
    }

    let inv = 1.0 / starts.len() as f64;
    for v in &mut accum {
        *v *= inv;
    }
    (onesided_freqs(nperseg, fs), accum)
}

fn check_fs(fs: f64) -> Result<(), ConfigError> {
    if !fs.is_finite() || fs <= 0.0 {
        return Err(ConfigError::InvalidArgument {
            arg: "fs",
            reason: "fs must be finite and > 0",
        });
    }
    Ok(())
}

fn checked_outputs<'a, OF, OP>(
    freqs: &'a mut OF,
    pxx: &'a mut OP,
    expected: usize,
) -> Result<(&'a mut [f64], &'a mut [f64]), ExecInvariantViolation>
where
    OF: Write1D<f64> + ?Sized,
    OP: Write1D<f64> + ?Sized,
{
    let f_out = freqs.write_slice_mut()?;
    if f_out.len() != expected {
        return Err(ExecInvariantViolation::LengthMismatch {
            arg: "freqs",
            expected,
            got: f_out.len(),
        });
    }
    let p_out = pxx.write_slice_mut()?;
    if p_out.len() != expected {
        return Err(ExecInvariantViolation::LengthMismatch {
            arg: "pxx",
            expected,
            got: p_out.len(),
        });
    }
    Ok((f_out, p_out))
}

/// Constructor config for [`PeriodogramKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodogramConfig {
    /// Sampling frequency in Hz.
    pub fs: f64,
}

/// Trait-first periodogram kernel (boxcar window, constant detrend).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodogramKernel {
    fs: f64,
}

impl KernelLifecycle for PeriodogramKernel {
    type Config = PeriodogramConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        check_fs(config.fs)?;
        Ok(Self { fs: config.fs })
    }
}

impl Periodogram1D for PeriodogramKernel {
    fn run_into<I, OF, OP>(
        &self,
        input: &I,
        freqs: &mut OF,
        pxx: &mut OP,
    ) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
        OF: Write1D<f64> + ?Sized,
        OP: Write1D<f64> + ?Sized,
    {
        let (f, p) = self.run_alloc(input)?;
        let (f_out, p_out) = checked_outputs(freqs, pxx, f.len())?;
        f_out.copy_from_slice(&f);
        p_out.copy_from_slice(&p);
        Ok(())
    }

    fn run_alloc<I>(&self, input: &I) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
    {
        let input = input.read_slice()?;
        if input.is_empty() {
            return Err(ExecInvariantViolation::InvalidState {
                reason: "periodogram input must be non-empty",
            });
        }
        Ok(periodogram_impl(input, self.fs))
    }
}

/// Constructor config for [`WelchKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchConfig {
    /// Sampling frequency in Hz.
    pub fs: f64,
    /// Segment length. Segments overlap by half.
    pub nperseg: usize,
}

/// Trait-first Welch PSD kernel (periodic Hann window, 50% overlap).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchKernel {
    fs: f64,
    nperseg: usize,
}

impl KernelLifecycle for WelchKernel {
    type Config = WelchConfig;

    fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
        check_fs(config.fs)?;
        if config.nperseg < 2 {
            return Err(ConfigError::InvalidArgument {
                arg: "nperseg",
                reason: "nperseg must be >= 2",
            });
        }
        Ok(Self {
            fs: config.fs,
            nperseg: config.nperseg,
        })
    }
}

impl WelchPsd1D for WelchKernel {
    fn run_into<I, OF, OP>(
        &self,
        input: &I,
        freqs: &mut OF,
        pxx: &mut OP,
    ) -> Result<(), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
        OF: Write1D<f64> + ?Sized,
        OP: Write1D<f64> + ?Sized,
    {
        let (f, p) = self.run_alloc(input)?;
        let (f_out, p_out) = checked_outputs(freqs, pxx, f.len())?;
        f_out.copy_from_slice(&f);
        p_out.copy_from_slice(&p);
        Ok(())
    }

    fn run_alloc<I>(&self, input: &I) -> Result<(Vec<f64>, Vec<f64>), ExecInvariantViolation>
    where
        I: Read1D<f64> + ?Sized,
    {
        let input = input.read_slice()?;
        if input.is_empty() {
            return Err(ExecInvariantViolation::InvalidState {
                reason: "welch input must be non-empty",
            });
        }
        Ok(welch_impl(input, self.fs, self.nperseg))
    }
}

/// Largest power of two that is `<= n` (0 for `n == 0`).
pub fn pow2_floor(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Periodogram power spectral density.
pub fn periodogram(x: &[f64], fs: f64) -> (Vec<f64>, Vec<f64>) {
    match PeriodogramKernel::try_new(PeriodogramConfig { fs }) {
        Ok(kernel) => kernel.run_alloc(x).unwrap_or_default(),
        Err(_) => (Vec::new(), Vec::new()),
    }
}

/// Welch power spectral density.
pub fn welch(x: &[f64], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    match WelchKernel::try_new(WelchConfig { fs, nperseg }) {
        Ok(kernel) => kernel.run_alloc(x).unwrap_or_default(),
        Err(_) => (Vec::new(), Vec::new()),
    }
}
