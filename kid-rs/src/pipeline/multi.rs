use super::{ChannelStatus, Pipeline};
use crate::calibrate::{CalibrationParams, StreamTiming};
use crate::error::PipelineError;
use crate::kernel::ConfigError;
use crate::linalg::Circle;
use crate::records::{StreamRecord, SweepRecord};
use crate::resonator::window::Windowing;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

/// One channel across several captures sharing a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChannelReport {
    /// Channel index.
    pub channel: usize,
    /// `Ok` or `CalibrationFailed`.
    pub status: ChannelStatus,
    /// Failure reason, if any.
    pub detail: Option<String>,
    /// Shared resonance circle `(xc, yc, R)`.
    pub circle: Option<Circle>,
    /// Frozen transform derived from the first capture.
    pub params: Option<CalibrationParams>,
    /// `df/f` per capture, in capture order.
    pub df_over_f: Vec<Vec<f64>>,
    /// Out-of-domain sample count per capture.
    pub out_of_domain: Vec<usize>,
    /// Captures whose tone frequency differs from the first capture's.
    pub retuned_captures: Vec<usize>,
}

/// Results of a multi-capture batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStreamOutput {
    /// One report per channel.
    pub channels: Vec<MultiChannelReport>,
    /// Time axes per capture.
    pub timing: Vec<StreamTiming>,
}

impl Pipeline {
    /// Calibrate each channel once against the first capture and apply the
    /// frozen transform to every capture.
    pub fn run_multi(
        &self,
        fine: &SweepRecord,
        gain: &SweepRecord,
        streams: &[StreamRecord],
    ) -> Result<MultiStreamOutput, PipelineError> {
        let first = streams.first().ok_or(ConfigError::EmptyInput { arg: "streams" })?;
        for stream in streams {
            self.check_shapes(fine, gain, stream)?;
        }
        let timing = streams
            .iter()
            .map(|s| self.timing(s))
            .collect::<Result<Vec<_>, _>>()?;
        let windowing = Windowing::from_sweep(fine);
        let nch = fine.n_channels();

        let channels = self.fan_out(nch, |ch| {
            let _span = info_span!("channel", ch).entered();
            let failed = |detail: String| {
                warn!(%detail, "channel calibration failed");
                MultiChannelReport {
                    channel: ch,
                    status: ChannelStatus::CalibrationFailed,
                    detail: Some(detail),
                    circle: None,
                    params: None,
                    df_over_f: Vec::new(),
                    out_of_domain: Vec::new(),
                    retuned_captures: Vec::new(),
                }
            };

            let tone = |s: &StreamRecord| s.tone_freq(ch).unwrap_or_else(|| fine.centre(ch));
            let retuned_captures: Vec<usize> = streams
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, s)| tone(s) != tone(first))
                .map(|(k, _)| k)
                .collect();
            if !retuned_captures.is_empty() {
                warn!(
                    calibrated_tone = tone(first),
                    captures = ?retuned_captures,
                    "tone frequency differs from the first capture, applying its transform anyway"
                );
            }

            let sweeps = self.sweeps(ch, fine, gain, &windowing, first.tone_freq(ch));
            let params = match self
                .preprocessor
                .samples(&first.z(ch))
                .and_then(|z| self.calibrator.calibrate(&sweeps, z, timing[0].clone()))
            {
                Ok(rec) => rec.params(),
                Err(err) => return failed(err.to_string()),
            };

            let mut df_over_f = Vec::with_capacity(streams.len());
            let mut out_of_domain = Vec::with_capacity(streams.len());
            for (k, stream) in streams.iter().enumerate() {
                match self
                    .preprocessor
                    .samples(&stream.z(ch))
                    .and_then(|z| params.apply(&z))
                {
                    Ok(cal) => {
                        df_over_f.push(cal.df_over_f);
                        out_of_domain.push(cal.out_of_domain);
                    }
                    Err(err) => return failed(format!("capture {k}: {err}")),
                }
            }
            MultiChannelReport {
                channel: ch,
                status: ChannelStatus::Ok,
                detail: None,
                circle: Some(params.circle),
                params: Some(params),
                df_over_f,
                out_of_domain,
                retuned_captures,
            }
        })?;

        info!(
            channels = nch,
            captures = streams.len(),
            failed = channels.iter().filter(|c| c.status != ChannelStatus::Ok).count(),
            "multi-capture batch complete"
        );
        Ok(MultiStreamOutput { channels, timing })
    }
}
