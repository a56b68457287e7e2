use approx::assert_relative_eq;
use core::f64::consts::PI;
use kid_rs::config::PipelineConfig;
use kid_rs::kernel::KernelLifecycle;
use kid_rs::pipeline::{BatchOutput, ChannelStatus, Pipeline};
use kid_rs::resonator::window::Windowing;
use kid_rs::resonator::ModelKind;
use kid_rs::signal::peak::{find_peaks, FindPeaksOptions};
use kid_rs::stats::{median, rms};
use kid_rs::synth::{Scenario, ScenarioConfig};
use std::sync::OnceLock;

type Run = (ScenarioConfig, Scenario, BatchOutput);

fn run_default(model: ModelKind) -> Run {
    let cfg = ScenarioConfig::default();
    let scenario = cfg.generate().expect("scenario");
    // the 1e-4 modulation swings about two linewidths around the tone
    let pipeline = Pipeline::try_new(PipelineConfig {
        phase_limit: 0.95 * PI,
        model,
        ..Default::default()
    })
    .expect("valid config");
    let out = pipeline
        .run(&scenario.fine, &scenario.gain, &scenario.stream)
        .expect("batch");
    (cfg, scenario, out)
}

fn scenario() -> &'static Run {
    static RUN: OnceLock<Run> = OnceLock::new();
    RUN.get_or_init(|| run_default(ModelKind::Magnitude))
}

#[test]
fn every_channel_fits_and_calibrates() {
    let (cfg, _, out) = scenario();
    assert_eq!(out.channels.len(), 3);
    for (report, truth) in out.channels.iter().zip(&cfg.resonators) {
        assert_eq!(report.status, ChannelStatus::Ok, "{:?}", report.detail);
        let fit = report.fit.as_ref().expect("fit");
        assert!((fit.fr() - truth.fr).abs() < 1.0e3, "fr {} vs {}", fit.fr(), truth.fr);
        assert_relative_eq!(fit.qr(), truth.qr, max_relative = 0.05);
        assert!(fit.reduced_chi_squared < 10.0);
        assert_eq!(fit.curve_freqs.len(), fit.model_curve.len());
    }
}

#[test]
fn iq_model_fits_through_the_gain_tilt() {
    let (cfg, _, out) = run_default(ModelKind::Iq);
    for (report, truth) in out.channels.iter().zip(&cfg.resonators) {
        assert_eq!(report.status, ChannelStatus::Ok, "{:?}", report.detail);
        let fit = report.fit.as_ref().expect("fit");
        assert_eq!(fit.model, ModelKind::Iq);
        assert!((fit.fr() - truth.fr).abs() < 1.0e3, "fr {} vs {}", fit.fr(), truth.fr);
        assert_relative_eq!(fit.qr(), truth.qr, max_relative = 0.05);
        assert!(fit.gain_baseline.is_some());
    }
}

#[test]
fn df_over_f_amplitude_matches_the_injected_signal() {
    let (cfg, scenario, out) = scenario();
    let expected = rms(scenario.signal.iter());
    for report in &out.channels {
        let rec = report.calibration.as_ref().expect("calibration");
        assert_eq!(rec.out_of_domain, 0);
        assert_eq!(rec.stream_df_over_f.len(), cfg.n_samples);
        assert_relative_eq!(rms(rec.stream_df_over_f.iter()), expected, max_relative = 0.1);
    }
}

#[test]
fn psd_peaks_at_the_modulation_frequency() {
    let (cfg, _, out) = scenario();
    for report in &out.channels {
        let noise = report.noise.as_ref().expect("noise");
        let bin = noise.fft_freqs[1];
        let peaks = find_peaks(&noise.sxx, FindPeaksOptions::default());
        let top = peaks
            .iter()
            .copied()
            .max_by(|a, b| noise.sxx[*a].total_cmp(&noise.sxx[*b]))
            .expect("a peak");
        assert!((noise.fft_freqs[top] - cfg.signal_freq).abs() <= bin);
        let (floor, _) = median::<_, f64>(noise.sxx.iter());
        assert!(noise.sxx[top] > 100.0 * floor);
        assert!(!noise.binned_freqs.is_empty());
        assert_eq!(noise.amp_subtracted.len(), noise.sxx_binned.len());
    }
}

#[test]
fn windows_split_at_channel_midpoints() {
    let (_, scenario, _) = scenario();
    let w = Windowing::from_sweep(&scenario.fine);
    assert_eq!(w.bounds(0), (0.0, 4.005e9));
    assert_eq!(w.bounds(1), (4.005e9, 4.0155e9));
    assert_eq!(w.bounds(2).0, 4.0155e9);
    assert!(w.bounds(2).1.is_infinite());
}

#[test]
fn batch_output_serializes_with_record_keys() {
    let (_, _, out) = scenario();
    let json = serde_json::to_value(out).expect("json");
    let rec = &json["channels"][0]["calibration"];
    for key in [
        "fine_z",
        "gain_z",
        "stream_z",
        "fine_freqs",
        "gain_freqs",
        "stream_corr",
        "gain_corr",
        "fine_corr",
        "stream_df_over_f",
        "time",
        "stream_time",
    ] {
        assert!(rec.get(key).is_some(), "missing {key}");
    }
    assert_eq!(json["channels"][0]["status"], "ok");
    assert!(json["channels"][0]["noise"].get("Sxx_binned").is_some());
}
