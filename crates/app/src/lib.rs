use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use toonify_core::checkpoint;
use toonify_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use toonify_core::frame::ResizeAlgorithm;
use toonify_core::generator::{parameter_specs, zero_checkpoint};
use toonify_core::logging::{self, LogSettings, DEFAULT_LOG_FILTER};
use toonify_core::tensor::NETWORK_INPUT_SIZE;
use toonify_core::transform::{self, ModelOptions};
use toonify_core::video::{verify_output, EndReason, ProgressCallback};
use toonify_core::ToonError;

#[derive(Parser)]
#[command(name = "toonify", about = "CartoonGAN style transfer for images and video")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cartoonize a single image
    Image(ImageArgs),
    /// Cartoonize every frame of a video
    Video(VideoArgs),
    /// Validate a checkpoint and print the network layout
    InspectModel(InspectArgs),
    /// Write a zero-initialised checkpoint
    InitModel(InitModelArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ResizeArg {
    Nearest,
    Bilinear,
}

impl From<ResizeArg> for ResizeAlgorithm {
    fn from(value: ResizeArg) -> Self {
        match value {
            ResizeArg::Nearest => ResizeAlgorithm::Nearest,
            ResizeArg::Bilinear => ResizeAlgorithm::Bilinear,
        }
    }
}

#[derive(Args)]
struct ImageArgs {
    input: PathBuf,
    output: PathBuf,
    #[arg(long, help = "Checkpoint path (overrides model.path in config.toml)")]
    model: Option<PathBuf>,
    #[arg(long, value_enum)]
    resize: Option<ResizeArg>,
}

#[derive(Args)]
struct VideoArgs {
    input: PathBuf,
    output: PathBuf,
    #[arg(long, help = "Checkpoint path (overrides model.path in config.toml)")]
    model: Option<PathBuf>,
    #[arg(long, help = "FFmpeg encoder name, e.g. mpeg4 or libx264")]
    codec: Option<String>,
    #[arg(long, help = "Transform workers; 1 runs the sequential pipeline")]
    workers: Option<usize>,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Args)]
struct InitModelArgs {
    output: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Image(args) => {
            let config = load_config(&resolved_data_dir);
            run_image(args, &config, &resolved_data_dir)
        }
        Commands::Video(args) => {
            toonify_core::runtime::log_tool_status();
            let config = load_config(&resolved_data_dir);
            run_video(args, &config, &resolved_data_dir).await
        }
        Commands::InspectModel(args) => {
            let config = load_config(&resolved_data_dir);
            inspect_model(args, &config, &resolved_data_dir)
        }
        Commands::InitModel(args) => init_model(&args.output),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let filters = LogSettings::from_cli(verbose, cli_log_filter).filters();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let log_file = data_dir.map(logging::open_log_file);
    let (file_layer, file_error) = match log_file {
        Some(Ok(log)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log.appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            (Some(layer), None)
        }
        Some(Err(error)) => (None, Some(format!("{error:#}"))),
        None => (None, Some("no data directory configured".to_string())),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(reason) = file_error {
        warn!(reason = %reason, "Log file unavailable; logging to the console only");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Config model settings, with `--model` taking the path as given on the
/// command line.
fn model_options(
    config: &AppConfig,
    data_dir: &Path,
    model_override: Option<PathBuf>,
) -> ModelOptions {
    let mut options = config.model_options(data_dir);
    if let Some(path) = model_override {
        options.path = path;
    }
    options
}

fn run_image(args: ImageArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = model_options(config, data_dir, args.model);
    let mut preprocessor = config.preprocessor();
    if let Some(resize) = args.resize {
        preprocessor.resize = resize.into();
    }

    let started = Instant::now();
    transform::transform_image_file(&args.input, &args.output, &model, &preprocessor)
        .context("Image transform failed")?;
    info!(
        output = %args.output.display(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Image written"
    );
    Ok(())
}

fn video_failure_context(error: &anyhow::Error, output: &Path) -> String {
    match error.downcast_ref::<ToonError>() {
        Some(ToonError::UnreadableMedia { .. }) => format!(
            "Video transform failed; input is unreadable and no output was written to {}",
            output.display()
        ),
        _ => "Video transform failed".to_string(),
    }
}

async fn run_video(args: VideoArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = model_options(config, data_dir, args.model);
    let mut options = config.video_options();
    if let Some(codec) = args.codec {
        options.codec = codec;
    }
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }

    info!(path = %model.path.display(), "Loading generator");
    let generator = Arc::new(transform::load_generator(&model).context("Failed to load model")?);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after in-flight frames");
            let _ = cancel_tx.send(true);
        }
    });

    let report = transform::transform_video(
        &args.input,
        &args.output,
        &generator,
        &options,
        cancel_rx,
        Some(make_progress_callback()),
    )
    .await;
    ctrl_c_task.abort();
    eprintln!();
    let report = report.map_err(|error| {
        let context = video_failure_context(&error, &args.output);
        error.context(context)
    })?;

    if report.end_reason == EndReason::Cancelled {
        warn!(frames_written = report.frames_written, "Video transform cancelled");
    }
    if report.frames_written == 0 {
        warn!("No frames were written; skipping output verification");
        return Ok(());
    }

    let size = NETWORK_INPUT_SIZE as u32;
    let probed = verify_output(&args.output, size, size)?;
    if let Some(count) = probed.frame_count {
        if count != report.frames_written {
            warn!(
                expected = report.frames_written,
                actual = count,
                "Output frame count differs from frames written"
            );
        }
    }
    info!(
        frames = report.frames_written,
        fps = %report.frame_rate,
        output = %args.output.display(),
        "Video transform completed"
    );
    Ok(())
}

fn inspect_model(args: InspectArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = model_options(config, data_dir, args.model);
    let generator = transform::load_generator(&model)
        .with_context(|| format!("Failed to load model: {}", model.path.display()))?;

    println!("Model: {}", model.path.display());
    println!("{:<10} {:<16} {:>10}  output", "layer", "kind", "params");
    for layer in generator.summary()? {
        println!(
            "{:<10} {:<16} {:>10}  {}",
            layer.name, layer.kind, layer.params, layer.output
        );
    }
    println!();
    println!("Parameters:");
    for spec in parameter_specs() {
        println!("  {:<24} {:?}", spec.key, spec.shape);
    }
    println!("Total parameters: {}", generator.param_count());
    Ok(())
}

fn init_model(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    checkpoint::save_safetensors(&zero_checkpoint(), output)?;
    let sha256 = checkpoint::sha256_file(output)?;
    info!(path = %output.display(), %sha256, "Zero-initialised checkpoint written");
    println!("{sha256}  {}", output.display());
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 2;

fn print_progress(written: u64, total: Option<u64>, total_elapsed: f64, fps_elapsed: f64) {
    let fps = compute_fps(written, fps_elapsed);

    if let Some(total) = total {
        let fraction = if total > 0 {
            (written as f64 / total as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let percent = fraction * 100.0;
        let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
        let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
        let bar: String = "█".repeat(filled) + &"░".repeat(empty);

        let eta = if fps > 0.0 {
            let remaining = total.saturating_sub(written) as f64;
            format!(" | ETA: {}", format_duration(remaining / fps))
        } else {
            String::new()
        };

        eprint!(
            "\r[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}    ",
            bar,
            percent,
            written,
            total,
            fps,
            format_duration(total_elapsed),
            eta,
        );
    } else {
        eprint!(
            "\rFrame {} | {:.1} fps | Elapsed: {}    ",
            written,
            fps,
            format_duration(total_elapsed),
        );
    }
}

/// Frames per second, excluding the first frames so model warm-up does not
/// drag the estimate down.
fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }

    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let fps_start = Mutex::new(None::<Instant>);
    Box::new(move |current, total| {
        let total_elapsed = start.elapsed().as_secs_f64();
        let fps_elapsed = {
            let mut start_opt = fps_start
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if start_opt.is_none() && current >= FPS_WARMUP_FRAMES {
                *start_opt = Some(Instant::now());
            }
            start_opt
                .as_ref()
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        };

        print_progress(current, total, total_elapsed, fps_elapsed);
    })
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn unreadable_video_error_says_no_output_was_written() {
        let error = anyhow::Error::new(ToonError::UnreadableMedia {
            path: PathBuf::from("in.mp4"),
            reason: "moov atom not found".into(),
        });
        let message = video_failure_context(&error, Path::new("out.mp4"));
        assert!(message.contains("no output was written to out.mp4"), "{message}");

        let other = anyhow::anyhow!("encoder exited");
        assert_eq!(video_failure_context(&other, Path::new("out.mp4")), "Video transform failed");
    }

    #[test]
    fn parses_video_command_with_global_flags() {
        let cli = Cli::try_parse_from([
            "toonify", "-vv", "video", "in.mp4", "out.mp4", "--workers", "4", "--codec",
            "libx264", "--data-dir", "/tmp/toon",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/toon")));
        match cli.command {
            Commands::Video(args) => {
                assert_eq!(args.input, PathBuf::from("in.mp4"));
                assert_eq!(args.workers, Some(4));
                assert_eq!(args.codec.as_deref(), Some("libx264"));
                assert!(args.model.is_none());
            }
            _ => panic!("expected video command"),
        }
    }

    #[test]
    fn parses_image_resize_choice() {
        let cli =
            Cli::try_parse_from(["toonify", "image", "a.jpg", "b.png", "--resize", "nearest"])
                .unwrap();
        match cli.command {
            Commands::Image(args) => {
                assert!(matches!(args.resize, Some(ResizeArg::Nearest)));
                assert_eq!(
                    ResizeAlgorithm::from(ResizeArg::Nearest),
                    ResizeAlgorithm::Nearest
                );
            }
            _ => panic!("expected image command"),
        }
        assert!(Cli::try_parse_from(["toonify", "image", "a", "b", "--resize", "cubic"]).is_err());
    }

    #[test]
    fn parses_inspect_and_init_commands() {
        let cli = Cli::try_parse_from(["toonify", "inspect-model", "--model", "g.safetensors"])
            .unwrap();
        assert!(matches!(cli.command, Commands::InspectModel(ref a) if a.model.is_some()));

        let cli = Cli::try_parse_from(["toonify", "init-model", "zero.safetensors"]).unwrap();
        assert!(matches!(cli.command, Commands::InitModel(_)));
    }

    #[test]
    fn model_override_replaces_config_path() {
        let config = AppConfig::default();
        let data = Path::new("/data");
        let from_config = model_options(&config, data, None);
        assert_eq!(
            from_config.path,
            PathBuf::from("/data/models/generator_quantitative.safetensors")
        );
        let overridden = model_options(&config, data, Some(PathBuf::from("local.safetensors")));
        assert_eq!(overridden.path, PathBuf::from("local.safetensors"));
    }

    #[test]
    fn init_model_writes_loadable_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("zero.safetensors");
        init_model(&path).unwrap();
        let generator = transform::load_generator(&ModelOptions::new(&path)).unwrap();
        assert!(generator.param_count() > 0);
    }
}

#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(3600.0), "01:00:00");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }
}

#[cfg(test)]
mod progress_fps_tests {
    use super::*;

    #[test]
    fn fps_is_zero_until_warmup_frames_pass() {
        assert_eq!(compute_fps(0, 1.0), 0.0);
        assert_eq!(compute_fps(1, 1.0), 0.0);
        assert_eq!(compute_fps(2, 1.0), 0.0);
    }

    #[test]
    fn fps_excludes_first_two_frames() {
        let fps = compute_fps(12, 5.0);
        assert!((fps - 2.0).abs() < 1e-9);
    }
}
