#![forbid(unsafe_code)]

//! yt-dlp invocation: turns a URL plus [`Resolution`] into exactly one media
//! file inside a caller-owned working directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::command::Resolution;
use crate::storage::{COOKIES_BUCKET, ObjectStore};

const COOKIES_FILE: &str = "cookies.txt";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const STDERR_TAIL: usize = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("yt-dlp could not be started: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("yt-dlp exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },
    #[error("yt-dlp did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("yt-dlp produced no .{0} file")]
    NoOutput(&'static str),
    #[error("working directory unavailable: {0}")]
    WorkDir(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub yt_dlp: PathBuf,
    pub ffmpeg: Option<PathBuf>,
    pub timeout: Duration,
    pub cookies_key: String,
}

pub struct MediaFetcher {
    config: FetcherConfig,
    store: Arc<dyn ObjectStore>,
}

/// Maps a free-form tag to a resolution, using `medium` for anything this
/// layer does not recognize.
pub fn resolve_tag(tag: &str) -> Resolution {
    tag.parse().unwrap_or_else(|_| {
        tracing::warn!(tag, "unrecognized resolution, using medium");
        Resolution::Medium
    })
}

impl MediaFetcher {
    pub fn new(config: FetcherConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    /// Downloads `url` into `work_dir` and returns the produced file. On
    /// failure nothing the tool wrote is left in `work_dir`.
    pub async fn fetch(
        &self,
        url: &str,
        resolution: Resolution,
        work_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(FetchError::WorkDir)?;

        let cookies = self.fetch_cookies(work_dir).await;
        let result = self.run_download(url, resolution, work_dir, cookies.as_deref()).await;

        if let Some(cookies) = &cookies {
            let _ = tokio::fs::remove_file(cookies).await;
        }
        if result.is_err() {
            purge_directory(work_dir).await;
        }
        result
    }

    async fn fetch_cookies(&self, work_dir: &Path) -> Option<PathBuf> {
        let target = work_dir.join(COOKIES_FILE);
        match self
            .store
            .get_file(COOKIES_BUCKET, &self.config.cookies_key, &target)
            .await
        {
            Ok(()) => Some(target),
            Err(err) => {
                tracing::warn!(error = %err, "continuing without cookies");
                None
            }
        }
    }

    async fn run_download(
        &self,
        url: &str,
        resolution: Resolution,
        work_dir: &Path,
        cookies: Option<&Path>,
    ) -> Result<PathBuf, FetchError> {
        let args = build_download_args(
            url,
            resolution,
            work_dir,
            cookies,
            self.config.ffmpeg.as_deref(),
        );
        tracing::info!(
            yt_dlp = %self.config.yt_dlp.display(),
            url,
            resolution = %resolution,
            "running downloader"
        );

        // yt-dlp leads its own process group so ffmpeg helpers die with it.
        let child = Command::new(&self.config.yt_dlp)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(FetchError::Spawn)?;
        let pid = child.id();

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(output) => output.map_err(FetchError::Spawn)?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                tracing::error!(url, timeout = ?self.config.timeout, "downloader timed out");
                return Err(FetchError::TimedOut(self.config.timeout));
            }
        };
        tracing::debug!(stdout = %String::from_utf8_lossy(&output.stdout), "downloader output");

        if !output.status.success() {
            let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL);
            tracing::error!(url, status = %output.status, stderr = %stderr, "downloader failed");
            return Err(FetchError::ToolFailed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let extension = resolution.output_extension();
        find_output(work_dir, extension).ok_or(FetchError::NoOutput(extension))
    }
}

fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pid, error = %err, "downloader process group already gone");
    }
}

/// Argument vector for one yt-dlp run, URL last.
pub fn build_download_args(
    url: &str,
    resolution: Resolution,
    work_dir: &Path,
    cookies: Option<&Path>,
    ffmpeg: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--output".to_string(),
        work_dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned(),
        "--format".to_string(),
        resolution.format_selector().to_string(),
    ];
    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    if let Some(ffmpeg) = ffmpeg {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().into_owned());
    }
    if resolution.is_audio() {
        args.extend(["--extract-audio", "--audio-format", "mp3"].map(String::from));
    } else {
        args.extend(["--merge-output-format", "mp4"].map(String::from));
    }
    args.push(url.to_string());
    args
}

/// First regular file directly inside `dir` with the given extension, by name.
fn find_output(dir: &Path, extension: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
}

/// Removes whatever a failed run left behind (`.part` files, fragments).
async fn purge_directory(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let removed = match entry.file_type().await {
            Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if let Err(err) = removed {
            tracing::warn!(path = %path.display(), error = %err, "could not remove partial download");
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
