use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::error::ToonError;
use crate::frame::{frame_len, ChannelOrder, Frame};

use super::pipeline::FrameSource;
use super::probe::{probe_video, FrameRate, VideoStreamInfo};

/// Decodes video to raw `bgr24` frames via an FFmpeg subprocess, one frame at
/// a time. Drains stderr in a background thread to prevent pipe deadlock.
/// Kills FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    info: VideoStreamInfo,
    frame_size: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
    buf: Vec<u8>,
    done: bool,
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgr24".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

impl VideoDecoder {
    /// Probes `path` and starts decoding its primary video stream. Any failure
    /// here is reported as [`ToonError::UnreadableMedia`].
    pub fn open(path: &Path) -> Result<Self> {
        let unreadable = |error: anyhow::Error| ToonError::UnreadableMedia {
            path: path.to_path_buf(),
            reason: format!("{error:#}"),
        };
        if !path.is_file() {
            return Err(unreadable(anyhow!("input file does not exist")).into());
        }
        let info = probe_video(path).map_err(unreadable)?;
        debug!(
            stream_index = info.stream_index,
            width = info.width,
            height = info.height,
            fps = %info.frame_rate,
            frames = ?info.frame_count,
            codec = %info.codec_name,
            pix_fmt = %info.pix_fmt,
            "video input probed"
        );
        Self::spawn(path, info).map_err(|error| unreadable(error).into())
    }

    pub fn spawn(path: &Path, info: VideoStreamInfo) -> Result<Self> {
        let frame_size = frame_len(info.width, info.height);
        let args = build_decoder_args(path, info.stream_index);
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg decoder");

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        Ok(Self {
            child,
            info,
            frame_size,
            stderr_thread,
            buf: vec![0u8; frame_size],
            done: false,
        })
    }

    pub fn info(&self) -> &VideoStreamInfo {
        &self.info
    }

    fn read_raw(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    self.done = true;
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    // A decode error mid-stream also closes stdout; only the
                    // exit status tells it apart from a clean end.
                    let status = self.child.wait().context("failed to wait for ffmpeg decoder")?;
                    check_decoder_exit(status)?;
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        Ok(Some(Frame::new(
            self.buf.clone(),
            self.info.width,
            self.info.height,
            ChannelOrder::Bgr,
        )?))
    }
}

fn check_decoder_exit(status: ExitStatus) -> Result<()> {
    if !status.success() {
        bail!("ffmpeg decoder exited with {status}");
    }
    Ok(())
}

impl FrameSource for VideoDecoder {
    fn frame_rate(&self) -> FrameRate {
        self.info.frame_rate
    }

    fn frame_count_hint(&self) -> Option<u64> {
        self.info.frame_count
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.read_raw()
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_args_request_bgr24_from_selected_stream() {
        let args = build_decoder_args(Path::new("clip.mp4"), 2);
        let joined = args.join(" ");
        assert!(joined.starts_with("-nostdin -i clip.mp4"));
        assert!(joined.contains("-map 0:2"));
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[cfg(unix)]
    #[test]
    fn decoder_exit_status_separates_clean_end_from_failure() {
        use std::os::unix::process::ExitStatusExt;

        assert!(check_decoder_exit(ExitStatus::from_raw(0)).is_ok());
        // Raw wait status: exit code 1 lives in the high byte.
        let err = check_decoder_exit(ExitStatus::from_raw(1 << 8)).unwrap_err();
        assert!(format!("{err}").contains("ffmpeg decoder exited"));
    }

    #[test]
    fn missing_input_is_unreadable_media() {
        let dir = tempfile::tempdir().unwrap();
        let err = VideoDecoder::open(&dir.path().join("absent.mp4"))
            .err()
            .expect("missing file must fail");
        assert!(matches!(
            err.downcast_ref::<ToonError>(),
            Some(ToonError::UnreadableMedia { .. })
        ));
    }
}
