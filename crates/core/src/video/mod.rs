//! Video I/O through `ffprobe` / `ffmpeg` subprocesses, and the sequential
//! per-frame pipeline that connects them.

pub mod decoder;
pub mod encoder;
pub mod pipeline;
pub mod probe;

pub use decoder::VideoDecoder;
pub use encoder::{verify_output, EncoderConfig, VideoEncoder};
pub use pipeline::{
    EndReason, FrameSink, FrameSource, FrameTransform, PipelineReport, PipelineState,
    ProgressCallback, StreamFormat, VideoPipeline,
};
pub use probe::{probe_video, FrameRate, VideoStreamInfo};
