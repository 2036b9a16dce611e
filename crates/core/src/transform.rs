//! Image and video entry points.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::checkpoint;
use crate::error::ToonError;
use crate::frame::Frame;
use crate::generator::Generator;
use crate::preprocess::Preprocessor;
use crate::streaming_executor::{StreamingExecutor, DEFAULT_BUFFER_SIZE};
use crate::video::{
    EncoderConfig, FrameSource, FrameTransform, PipelineReport, ProgressCallback, StreamFormat,
    VideoDecoder, VideoEncoder, VideoPipeline,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOptions {
    pub path: PathBuf,
    pub key_prefix: String,
    /// Hex SHA-256 of the parameter file; verified before loading when set.
    pub sha256: Option<String>,
}

impl ModelOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

pub fn load_generator(options: &ModelOptions) -> Result<Generator> {
    if let Some(expected) = options.sha256.as_deref().filter(|s| !s.trim().is_empty()) {
        if options.path.is_file() {
            checkpoint::verify_checksum(&options.path, expected)?;
        }
    }
    Ok(Generator::load(&options.path, &options.key_prefix)?)
}

/// Per-frame cartoonization: resize to 256x256, run the generator and return
/// a 256x256 frame in the input's channel order.
#[derive(Debug, Clone)]
pub struct Cartoonizer {
    generator: Arc<Generator>,
    preprocessor: Preprocessor,
}

impl Cartoonizer {
    pub fn new(generator: Arc<Generator>, preprocessor: Preprocessor) -> Self {
        Self {
            generator,
            preprocessor,
        }
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }
}

impl FrameTransform for Cartoonizer {
    fn transform(&self, frame: &Frame) -> Result<Frame> {
        cartoonize_frame(&self.generator, &self.preprocessor, frame)
    }
}

fn cartoonize_frame(
    generator: &Generator,
    preprocessor: &Preprocessor,
    frame: &Frame,
) -> Result<Frame> {
    let input = preprocessor.to_tensor(frame)?;
    let output = generator.forward(&input)?;
    Ok(preprocessor.to_frame(&output, frame.order)?)
}

/// Decodes `input`, cartoonizes it and writes a 256x256 image to `output` in
/// the format named by its extension. Nothing is written if decoding fails.
pub fn transform_image(
    input: &Path,
    output: &Path,
    generator: &Generator,
    preprocessor: &Preprocessor,
) -> Result<()> {
    let decoded = image::open(input).map_err(|error| ToonError::UnreadableMedia {
        path: input.to_path_buf(),
        reason: error.to_string(),
    })?;
    debug!(
        path = %input.display(),
        width = decoded.width(),
        height = decoded.height(),
        "image decoded"
    );

    let frame = Frame::from_rgb_image(decoded.to_rgb8());
    let cartoon = cartoonize_frame(generator, preprocessor, &frame)?.into_rgb_image()?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    cartoon
        .save(output)
        .with_context(|| format!("Failed to write image: {}", output.display()))?;

    info!(input = %input.display(), output = %output.display(), "image transformed");
    Ok(())
}

/// Loads the generator described by `model`, then runs [`transform_image`].
pub fn transform_image_file(
    input: &Path,
    output: &Path,
    model: &ModelOptions,
    preprocessor: &Preprocessor,
) -> Result<()> {
    let generator = load_generator(model)?;
    transform_image(input, output, &generator, preprocessor)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOptions {
    pub codec: String,
    pub codec_tag: Option<String>,
    pub quality: Option<u32>,
    pub pixel_format: String,
    pub preprocessor: Preprocessor,
    /// 1 runs the sequential pipeline; more uses the streaming executor.
    pub workers: usize,
    pub buffer_size: usize,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            codec: "mpeg4".to_string(),
            codec_tag: Some("mp4v".to_string()),
            quality: Some(5),
            pixel_format: "yuv420p".to_string(),
            preprocessor: Preprocessor::default(),
            workers: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl VideoOptions {
    pub fn encoder_config(&self, output: &Path, format: &StreamFormat) -> EncoderConfig {
        EncoderConfig {
            codec: self.codec.clone(),
            codec_tag: self.codec_tag.clone(),
            quality: self.quality,
            pixel_format: self.pixel_format.clone(),
            ..EncoderConfig::for_stream(output, format)
        }
    }
}

/// Cartoonizes every frame of `input` into a 256x256 video at `output` with
/// the same frame rate. The generator must already be built, so a bad
/// checkpoint fails before the output file is created.
pub async fn transform_video(
    input: &Path,
    output: &Path,
    generator: &Arc<Generator>,
    options: &VideoOptions,
    cancel: watch::Receiver<bool>,
    progress: Option<ProgressCallback>,
) -> Result<PipelineReport> {
    let cartoonizer = Cartoonizer::new(Arc::clone(generator), options.preprocessor);
    let input_path = input.to_path_buf();
    let decoder = tokio::task::spawn_blocking(move || VideoDecoder::open(&input_path))
        .await
        .context("decoder open task panicked")??;

    let format = StreamFormat::network_output(decoder.frame_rate());
    let encoder_config = options.encoder_config(output, &format);
    info!(
        input = %input.display(),
        output = %output.display(),
        source = %format!("{}x{}", decoder.info().width, decoder.info().height),
        fps = %format.frame_rate,
        frames = ?decoder.frame_count_hint(),
        workers = options.workers,
        "starting video transform"
    );

    let report = if options.workers <= 1 {
        tokio::task::spawn_blocking(move || -> Result<PipelineReport> {
            let mut pipeline =
                VideoPipeline::open(decoder, |_| VideoEncoder::new(&encoder_config))?;
            if let Some(progress) = progress {
                pipeline = pipeline.with_progress(progress);
            }
            pipeline.run(&cartoonizer, &cancel)
        })
        .await
        .context("video pipeline task panicked")??
    } else {
        let encoder = VideoEncoder::new(&encoder_config)?;
        StreamingExecutor::new(options.buffer_size, options.workers)
            .execute(decoder, Arc::new(cartoonizer), encoder, cancel, progress)
            .await?
    };

    info!(
        frames_read = report.frames_read,
        frames_written = report.frames_written,
        end_reason = ?report.end_reason,
        "video transform finished"
    );
    Ok(report)
}
