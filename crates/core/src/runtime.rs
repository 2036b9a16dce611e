use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

/// Directory searched first for `ffmpeg` / `ffprobe`.
pub const FFMPEG_DIR_ENV: &str = "TOONIFY_FFMPEG_DIR";

/// Search directories for bundled tools, in priority order:
///   1. `$TOONIFY_FFMPEG_DIR`
///   2. `<exe_dir>/`, `<exe_dir>/bin/`, `<exe_dir>/../bin/`
///   3. `<cwd>/`, `<cwd>/bin/`
///
/// Anything not found here falls back to a plain `PATH` lookup.
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(FFMPEG_DIR_ENV).filter(|v| !v.is_empty()) {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

/// ffmpeg builds for Windows ship as `.exe` only.
fn executable_name(binary: &str) -> String {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = executable_name(binary);
    dirs.iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

fn find_binary_on_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = env::split_paths(&path).collect();
    find_binary_in_dirs(binary, &dirs)
}

/// Where `binary` would be launched from, if anywhere.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs()).or_else(|| find_binary_on_path(binary))
}

pub fn command_for(binary: &str) -> ProcessCommand {
    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}

/// Log which external tools were resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_tool_status() {
    for tool in ["ffmpeg", "ffprobe"] {
        match resolve_binary(tool) {
            Some(path) => info!(tool, path = %path.display(), "External tool resolved"),
            None => warn!(tool, "External tool not found; video commands will fail"),
        }
    }
}
