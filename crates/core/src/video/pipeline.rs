//! Sequential per-frame video pipeline.
//!
//! `Idle -> Opened -> {Reading -> Transforming -> Writing}* -> Closed`.
//! A read failure ends the stream the same way end-of-stream does; transform
//! and write failures abort the run and return the error.

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::tensor::NETWORK_INPUT_SIZE;

use super::probe::FrameRate;

/// Ordered producer of decoded frames.
pub trait FrameSource: Send {
    fn frame_rate(&self) -> FrameRate;

    /// Expected number of frames, when the container records it.
    fn frame_count_hint(&self) -> Option<u64> {
        None
    }

    /// `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// Ordered consumer of output frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Per-frame function applied between source and sink.
pub trait FrameTransform: Send + Sync {
    fn transform(&self, frame: &Frame) -> Result<Frame>;
}

/// Called after every written frame with `(frames_written, frame_count_hint)`.
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send>;

/// Format the sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub frame_rate: FrameRate,
    pub width: u32,
    pub height: u32,
}

impl StreamFormat {
    pub fn network_output(frame_rate: FrameRate) -> Self {
        Self {
            frame_rate,
            width: NETWORK_INPUT_SIZE as u32,
            height: NETWORK_INPUT_SIZE as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opened,
    Reading,
    Transforming,
    Writing,
    Closed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Opened)
            | (Opened, Reading)
            | (Reading, Transforming)
            | (Transforming, Writing)
            | (Writing, Reading) => true,
            (Idle, Closed) | (Closed, Closed) => false,
            (_, Closed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EndOfStream,
    ReadFailure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_read: u64,
    pub frames_written: u64,
    pub frame_rate: FrameRate,
    pub end_reason: EndReason,
}

pub struct VideoPipeline<Src: FrameSource, Snk: FrameSink> {
    source: Src,
    sink: Option<Snk>,
    state: PipelineState,
    format: StreamFormat,
    frames_read: u64,
    frames_written: u64,
    progress: Option<ProgressCallback>,
}

impl<Src: FrameSource, Snk: FrameSink> VideoPipeline<Src, Snk> {
    /// Opens the sink with the source's frame rate at 256x256.
    pub fn open<F>(source: Src, open_sink: F) -> Result<Self>
    where
        F: FnOnce(&StreamFormat) -> Result<Snk>,
    {
        let format = StreamFormat::network_output(source.frame_rate());
        let sink = open_sink(&format)?;
        let mut pipeline = Self {
            source,
            sink: Some(sink),
            state: PipelineState::Idle,
            format,
            frames_read: 0,
            frames_written: 0,
            progress: None,
        };
        pipeline.transition(PipelineState::Opened)?;
        debug!(fps = %format.frame_rate, "video pipeline opened");
        Ok(pipeline)
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!("invalid pipeline transition {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Runs until end of stream, read failure, or cancellation; then finishes
    /// the sink. On a transform or write error the sink is dropped unfinished.
    pub fn run<T>(&mut self, transform: &T, cancel: &watch::Receiver<bool>) -> Result<PipelineReport>
    where
        T: FrameTransform + ?Sized,
    {
        if self.state != PipelineState::Opened {
            bail!("pipeline must be freshly opened to run, state is {:?}", self.state);
        }

        let end_reason = match self.pump(transform, cancel) {
            Ok(reason) => reason,
            Err(error) => {
                drop(self.sink.take());
                self.state = PipelineState::Closed;
                return Err(error);
            }
        };

        self.transition(PipelineState::Closed)?;
        if let Some(mut sink) = self.sink.take() {
            sink.finish()?;
        }

        info!(
            frames_read = self.frames_read,
            frames_written = self.frames_written,
            end_reason = ?end_reason,
            "video pipeline closed"
        );
        Ok(PipelineReport {
            frames_read: self.frames_read,
            frames_written: self.frames_written,
            frame_rate: self.format.frame_rate,
            end_reason,
        })
    }

    fn pump<T>(&mut self, transform: &T, cancel: &watch::Receiver<bool>) -> Result<EndReason>
    where
        T: FrameTransform + ?Sized,
    {
        let total = self.source.frame_count_hint();
        loop {
            if *cancel.borrow() {
                return Ok(EndReason::Cancelled);
            }

            self.transition(PipelineState::Reading)?;
            let frame = match self.source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(EndReason::EndOfStream),
                Err(error) => {
                    warn!(
                        frames_read = self.frames_read,
                        "stopping at frame read failure: {error:#}"
                    );
                    return Ok(EndReason::ReadFailure);
                }
            };
            self.frames_read += 1;

            self.transition(PipelineState::Transforming)?;
            let output = transform.transform(&frame)?;

            self.transition(PipelineState::Writing)?;
            let Some(sink) = self.sink.as_mut() else {
                bail!("sink already closed");
            };
            sink.write_frame(&output)?;
            self.frames_written += 1;

            if let Some(progress) = &self.progress {
                progress(self.frames_written, total);
            }
        }
    }
}
