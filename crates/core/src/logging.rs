//! Log filter selection and the rolling log file used by the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "toonify";
const LOG_FILE_SUFFIX: &str = "log";

/// Targets the ffmpeg stderr drain threads log under.
pub const FFMPEG_STDERR_TARGETS: [&str; 2] = ["ffmpeg_stderr", "ffmpeg_encode_stderr"];

/// Where the active filter came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Flag,
    Verbose,
    Env,
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub log_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub source: FilterSource,
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// Settings for the CLI flags, with `RUST_LOG` read from the environment.
    pub fn from_cli(verbose: u8, log_filter: Option<&str>) -> Self {
        Self {
            verbose,
            log_filter: log_filter.map(ToString::to_string),
            rust_log: std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()),
        }
    }

    fn base_filter(&self) -> (FilterSource, String) {
        if let Some(filter) = self.log_filter.as_deref() {
            (FilterSource::Flag, filter.to_string())
        } else if self.verbose >= 2 {
            (FilterSource::Verbose, "trace".to_string())
        } else if self.verbose == 1 {
            (FilterSource::Verbose, "debug".to_string())
        } else if let Some(filter) = self.rust_log.as_deref() {
            (FilterSource::Env, filter.to_string())
        } else {
            (FilterSource::Default, DEFAULT_LOG_FILTER.to_string())
        }
    }

    /// `--log-filter` and `-v` apply verbatim to both sinks. Otherwise ffmpeg's
    /// stderr chatter is held to errors on the console and kept at debug in
    /// the log file.
    pub fn filters(&self) -> LogFilters {
        let (source, base) = self.base_filter();
        match source {
            FilterSource::Flag | FilterSource::Verbose => LogFilters {
                source,
                console: base.clone(),
                file: base,
            },
            FilterSource::Env | FilterSource::Default => LogFilters {
                source,
                console: with_ffmpeg_level("error", &base),
                file: with_ffmpeg_level("debug", &base),
            },
        }
    }
}

fn with_ffmpeg_level(level: &str, base: &str) -> String {
    let mut directives: Vec<String> = FFMPEG_STDERR_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push(base.to_string());
    directives.join(",")
}

#[derive(Debug)]
pub struct LogFile {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

/// Opens a daily rolling `toonify.*.log` under `<data_dir>/logs`, keeping the
/// newest `LOG_RETENTION_FILES` files.
pub fn open_log_file(data_dir: &Path) -> Result<LogFile> {
    let dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log in {}", dir.display()))?;

    Ok(LogFile { dir, appender })
}
