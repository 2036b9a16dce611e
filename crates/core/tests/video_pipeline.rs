mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;

use toonify_core::frame::{ChannelOrder, Frame};
use toonify_core::generator::{zero_checkpoint, Generator};
use toonify_core::preprocess::Preprocessor;
use toonify_core::streaming_executor::StreamingExecutor;
use toonify_core::transform::{transform_video, Cartoonizer, VideoOptions};
use toonify_core::video::{EndReason, FrameRate, FrameSink, FrameSource, VideoPipeline};

struct ClipSource {
    frames: Vec<Frame>,
    rate: FrameRate,
}

impl ClipSource {
    fn new(count: u8) -> Self {
        let frames = (0..count)
            .map(|i| Frame::solid(96, 54, ChannelOrder::Bgr, [i * 40, 128, 255 - i * 40]))
            .collect();
        Self {
            frames,
            rate: FrameRate::new(30000, 1001).unwrap(),
        }
    }
}

impl FrameSource for ClipSource {
    fn frame_rate(&self) -> FrameRate {
        self.rate
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.frames.remove(0)))
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    finished: Arc<Mutex<bool>>,
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}

fn random_cartoonizer() -> Cartoonizer {
    let generator = Generator::from_source(&common::random_checkpoint(5)).unwrap();
    Cartoonizer::new(Arc::new(generator), Preprocessor::default())
}

#[test]
fn sequential_pipeline_preserves_count_rate_and_order() {
    let sink = RecordingSink::default();
    let opened = sink.clone();
    let (_tx, rx) = watch::channel(false);
    let mut pipeline = VideoPipeline::open(ClipSource::new(3), |format| {
        assert_eq!(format.frame_rate, FrameRate::new(30000, 1001).unwrap());
        assert_eq!((format.width, format.height), (256, 256));
        Ok(opened)
    })
    .unwrap();

    let report = pipeline.run(&random_cartoonizer(), &rx).unwrap();
    assert_eq!(report.frames_read, 3);
    assert_eq!(report.frames_written, 3);
    assert_eq!(report.end_reason, EndReason::EndOfStream);
    assert_eq!(report.frame_rate, FrameRate::new(30000, 1001).unwrap());

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 3);
    for frame in frames.iter() {
        assert_eq!((frame.width, frame.height), (256, 256));
        assert_eq!(frame.order, ChannelOrder::Bgr);
    }
    assert!(*sink.finished.lock().unwrap());
}

#[tokio::test]
async fn streaming_executor_matches_sequential_output() {
    let cartoonizer = random_cartoonizer();

    let sequential = RecordingSink::default();
    let opened = sequential.clone();
    let (_tx, rx) = watch::channel(false);
    VideoPipeline::open(ClipSource::new(3), |_| Ok(opened))
        .unwrap()
        .run(&cartoonizer, &rx)
        .unwrap();

    let streamed = RecordingSink::default();
    let report = StreamingExecutor::new(2, 3)
        .execute(
            ClipSource::new(3),
            Arc::new(cartoonizer),
            streamed.clone(),
            rx.clone(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.frames_written, 3);
    assert_eq!(report.end_reason, EndReason::EndOfStream);
    assert_eq!(*sequential.frames.lock().unwrap(), *streamed.frames.lock().unwrap());
    assert!(*streamed.finished.lock().unwrap());
}

#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let generator = Arc::new(Generator::from_source(&zero_checkpoint()).unwrap());
    let cartoonizer = Cartoonizer::new(generator, Preprocessor::default());
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let sink = RecordingSink::default();
    let report = StreamingExecutor::new(4, 2)
        .execute(ClipSource::new(5), Arc::new(cartoonizer), sink.clone(), rx, None)
        .await
        .unwrap();

    assert_eq!(report.end_reason, EndReason::Cancelled);
    assert_eq!(report.frames_written, 0);
    assert!(sink.frames.lock().unwrap().is_empty());
}

/// Needs ffmpeg and ffprobe on PATH (or `TOONIFY_FFMPEG_DIR`).
#[tokio::test]
#[ignore]
async fn ffmpeg_round_trip_keeps_frame_count_and_rate() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    let status = std::process::Command::new("ffmpeg")
        .args([
            "-nostdin", "-y", "-f", "lavfi", "-i", "testsrc=size=160x90:rate=25", "-frames:v",
            "6", "-pix_fmt", "yuv420p",
        ])
        .arg(&input)
        .status()
        .expect("ffmpeg must be installed for this test");
    assert!(status.success());

    let output = dir.path().join("out").join("cartoon.mp4");
    let generator = Arc::new(Generator::from_source(&zero_checkpoint()).unwrap());
    for workers in [1, 3] {
        let options = VideoOptions {
            workers,
            ..VideoOptions::default()
        };
        let (_tx, rx) = watch::channel(false);
        let report = transform_video(&input, &output, &generator, &options, rx, None)
            .await
            .unwrap();
        assert_eq!(report.frames_written, 6);
        assert_eq!(report.frame_rate, FrameRate::new(25, 1).unwrap());

        let info = toonify_core::video::verify_output(&output, 256, 256).unwrap();
        assert_eq!(info.frame_rate, FrameRate::new(25, 1).unwrap());
        assert_eq!(info.frame_count, Some(6));
    }
}
