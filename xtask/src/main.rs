use anyhow::{Context, Result};
use kid_rs::config::PipelineConfig;
use kid_rs::kernel::KernelLifecycle;
use kid_rs::pipeline::{BatchOutput, ChannelReport, ChannelStatus, Pipeline};
use kid_rs::signal::peak::{find_peaks, FindPeaksOptions};
use kid_rs::stats::rms;
use kid_rs::synth::ScenarioConfig;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Clone)]
struct ScenarioRow {
    channel: usize,
    status: ChannelStatus,
    true_fr: f64,
    true_qr: f64,
    fit_fr: f64,
    fit_qr: f64,
    reduced_chi_squared: f64,
    df_over_f_rms: f64,
    out_of_domain: usize,
    psd_peak_freq: f64,
}

#[derive(Debug, Serialize)]
struct ScenarioBundle {
    generated_epoch_seconds: u64,
    elapsed_ms: f64,
    sample_rate: f64,
    injected_rms: f64,
    scenario: ScenarioConfig,
    rows: Vec<ScenarioRow>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("scenario") => run_scenario(args.next().as_deref()),
        _ => {
            eprintln!("Usage:");
            eprintln!("  cargo run -p xtask -- scenario [scenario.json]");
            Ok(())
        }
    }
}

fn run_scenario(config_path: Option<&str>) -> Result<()> {
    let cfg: ScenarioConfig = match config_path {
        Some(path) => {
            let raw = fs::read(path).with_context(|| format!("reading {path}"))?;
            serde_json::from_slice(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => ScenarioConfig::default(),
    };

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let out_dir = PathBuf::from(format!("target/scenarios/{ts}"));
    fs::create_dir_all(&out_dir).context("creating scenario output directory")?;

    let scenario = cfg.generate().context("generating synthetic scenario")?;
    // the default modulation swings the tone about two linewidths
    let pipeline = Pipeline::try_new(PipelineConfig {
        phase_limit: 0.95 * std::f64::consts::PI,
        ..Default::default()
    })
    .context("building pipeline")?;

    let start = Instant::now();
    let out = pipeline
        .run(&scenario.fine, &scenario.gain, &scenario.stream)
        .context("running batch")?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
    info!(elapsed_ms, "scenario batch finished");

    let rows = out
        .channels
        .iter()
        .zip(&cfg.resonators)
        .map(|(report, truth)| build_row(report, truth.fr, truth.qr))
        .collect::<Vec<_>>();

    let bundle = ScenarioBundle {
        generated_epoch_seconds: ts,
        elapsed_ms,
        sample_rate: out.sample_rate,
        injected_rms: rms(scenario.signal.iter()),
        scenario: cfg,
        rows,
    };

    write_summary_csv(&out_dir.join("summary.csv"), &bundle.rows)?;
    fs::write(
        out_dir.join("summary.json"),
        serde_json::to_vec_pretty(&bundle).context("serializing summary bundle")?,
    )
    .context("writing summary.json")?;
    write_batch(&out_dir.join("batch.json"), &out)?;

    println!("Scenario artifacts generated in: {}", out_dir.display());
    println!("  - {}", out_dir.join("summary.csv").display());
    println!("  - {}", out_dir.join("summary.json").display());
    println!("  - {}", out_dir.join("batch.json").display());
    println!(
        "  - channels ok: {}/{}",
        out.count(ChannelStatus::Ok),
        out.channels.len()
    );

    Ok(())
}

fn build_row(report: &ChannelReport, true_fr: f64, true_qr: f64) -> ScenarioRow {
    let (fit_fr, fit_qr, reduced_chi_squared) = report
        .fit
        .as_ref()
        .map(|f| (f.fr(), f.qr(), f.reduced_chi_squared))
        .unwrap_or((f64::NAN, f64::NAN, f64::NAN));
    let (df_over_f_rms, out_of_domain) = report
        .calibration
        .as_ref()
        .map(|c| {
            let finite = c.stream_df_over_f.iter().filter(|v| v.is_finite());
            (rms(finite), c.out_of_domain)
        })
        .unwrap_or((f64::NAN, 0));
    let psd_peak_freq = report
        .noise
        .as_ref()
        .and_then(|n| {
            find_peaks(&n.sxx, FindPeaksOptions::default())
                .into_iter()
                .max_by(|a, b| n.sxx[*a].total_cmp(&n.sxx[*b]))
                .map(|i| n.fft_freqs[i])
        })
        .unwrap_or(f64::NAN);
    ScenarioRow {
        channel: report.channel,
        status: report.status,
        true_fr,
        true_qr,
        fit_fr,
        fit_qr,
        reduced_chi_squared,
        df_over_f_rms,
        out_of_domain,
        psd_peak_freq,
    }
}

fn write_batch(path: &Path, out: &BatchOutput) -> Result<()> {
    let bytes = serde_json::to_vec(out).context("serializing batch output")?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn write_summary_csv(path: &Path, rows: &[ScenarioRow]) -> Result<()> {
    let mut out = String::new();
    out.push_str("channel,status,true_fr,true_qr,fit_fr,fit_qr,reduced_chi_squared,df_over_f_rms,out_of_domain,psd_peak_freq\n");
    for row in rows {
        out.push_str(&format!(
            "{},{:?},{:.3},{:.1},{:.3},{:.1},{:.6},{:.6e},{},{:.6}\n",
            row.channel,
            row.status,
            row.true_fr,
            row.true_qr,
            row.fit_fr,
            row.fit_qr,
            row.reduced_chi_squared,
            row.df_over_f_rms,
            row.out_of_domain,
            row.psd_peak_freq
        ));
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}
