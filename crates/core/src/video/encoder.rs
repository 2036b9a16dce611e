//! FFmpeg encode subprocess fed raw `bgr24` frames over stdin.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::frame::{frame_len, ChannelOrder, Frame};

use super::pipeline::{FrameSink, StreamFormat};
use super::probe::{probe_video, FrameRate, VideoStreamInfo};

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// FFmpeg encoder name (e.g. "mpeg4", "libx264").
    pub codec: String,
    /// Container fourcc tag (e.g. "mp4v"); omitted when `None`.
    pub codec_tag: Option<String>,
    /// Fixed quantizer passed as `-q:v`; the encoder default when `None`.
    pub quality: Option<u32>,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

impl EncoderConfig {
    pub fn for_stream(output_path: &Path, format: &StreamFormat) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            codec: "mpeg4".to_string(),
            codec_tag: Some("mp4v".to_string()),
            quality: Some(5),
            pixel_format: "yuv420p".to_string(),
            width: format.width,
            height: format.height,
            frame_rate: format.frame_rate,
        }
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.frame_rate.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
        ];

        if let Some(tag) = self.codec_tag.as_deref().filter(|t| !t.is_empty()) {
            args.extend(["-tag:v".into(), tag.to_string()]);
        }
        if let Some(quality) = self.quality {
            args.extend(["-q:v".into(), quality.to_string()]);
        }

        args.extend([
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-r".into(),
            self.frame_rate.to_string(),
            "-v".into(),
            "error".into(),
        ]);
        args.push(self.output_path.to_string_lossy().into_owned());
        args
    }

    pub fn frame_size(&self) -> usize {
        frame_len(self.width, self.height)
    }
}

/// FFmpeg encode subprocess. Accepts raw BGR frames via stdin pipe, drains
/// stderr in a background thread, kills FFmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    frames_written: u64,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();
        let frame_size = config.frame_size();

        if let Some(parent) = config
            .output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_encode_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        debug!(
            width = config.width,
            height = config.height,
            fps = %config.frame_rate,
            codec = %config.codec,
            tag = ?config.codec_tag,
            pix_fmt = %config.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread,
            frame_size,
            frames_written: 0,
        })
    }

    /// Frame data must be exactly `width * height * 3` bytes of BGR.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!(frames = self.frames_written, "FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.order == ChannelOrder::Bgr {
            self.write_raw(&frame.data)
        } else {
            let bgr = frame.clone().to_order(ChannelOrder::Bgr);
            self.write_raw(&bgr.data)
        }
    }

    fn finish(&mut self) -> Result<()> {
        VideoEncoder::finish(self)
    }
}

/// Probes the encoded file and checks its resolution.
pub fn verify_output(
    output_path: &Path,
    expected_width: u32,
    expected_height: u32,
) -> Result<VideoStreamInfo> {
    let info = probe_video(output_path)
        .with_context(|| format!("failed to verify output {}", output_path.display()))?;

    if info.width != expected_width || info.height != expected_height {
        bail!(
            "output resolution mismatch: expected {}x{}, got {}x{}",
            expected_width,
            expected_height,
            info.width,
            info.height
        );
    }

    info!(
        path = %output_path.display(),
        width = info.width,
        height = info.height,
        fps = %info.frame_rate,
        frames = ?info.frame_count,
        codec = %info.codec_name,
        "output verification passed"
    );
    Ok(info)
}
