use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    /// Container-reported frame count; absent or "N/A" for some formats.
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    format_name: Option<String>,
}

/// A rational frame rate, kept exact so it can be handed back to ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// Used when a stream reports no usable rate (NTSC film).
    pub const FALLBACK: FrameRate = FrameRate {
        num: 24000,
        den: 1001,
    };

    pub fn new(num: u32, den: u32) -> Option<Self> {
        (num > 0 && den > 0).then_some(Self { num, den })
    }

    /// Parses `"num/den"` or a decimal like `"29.97"`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some((num, den)) = s.split_once('/') {
            return Self::new(num.trim().parse().ok()?, den.trim().parse().ok()?);
        }
        let value: f64 = s.parse().ok()?;
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        let scaled = (value * 1000.0).round();
        if scaled > u32::MAX as f64 {
            return None;
        }
        Self::new(scaled as u32, 1000)
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    debug!(path = %path.display(), "running ffprobe");
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe; is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// `None` when the container does not record it.
    pub frame_count: Option<u64>,
    pub codec_name: String,
    pub pix_fmt: String,
    pub container_format: String,
}

pub fn extract_stream_info(probe: &FfprobeOutput) -> Result<VideoStreamInfo> {
    let video_stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = video_stream
        .width
        .filter(|&w| w > 0)
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video_stream
        .height
        .filter(|&h| h > 0)
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let frame_rate = video_stream
        .r_frame_rate
        .as_deref()
        .and_then(FrameRate::parse)
        .or_else(|| video_stream.avg_frame_rate.as_deref().and_then(FrameRate::parse));
    let frame_rate = match frame_rate {
        Some(rate) => rate,
        None => {
            warn!(
                r_frame_rate = ?video_stream.r_frame_rate,
                avg_frame_rate = ?video_stream.avg_frame_rate,
                "could not determine frame rate, defaulting to {}",
                FrameRate::FALLBACK
            );
            FrameRate::FALLBACK
        }
    };

    let frame_count = video_stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok())
        .filter(|&n| n > 0);

    Ok(VideoStreamInfo {
        stream_index: video_stream.index,
        width,
        height,
        frame_rate,
        frame_count,
        codec_name: video_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        pix_fmt: video_stream
            .pix_fmt
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        container_format: probe
            .format
            .as_ref()
            .and_then(|f| f.format_name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    let probe = run_ffprobe(path)?;
    extract_stream_info(&probe)
}
