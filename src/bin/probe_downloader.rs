#![forbid(unsafe_code)]

//! Health probe for the downloader toolchain: fetches one URL with the same
//! settings the server uses, reports the artifact, then deletes it. Exits
//! non-zero when the download fails, so it can run from cron or a monitor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tubedrop::command::Resolution;
use tubedrop::config::{RuntimeOverrides, resolve_runtime_config};
use tubedrop::delivery::size_mb;
use tubedrop::fetcher::{FetcherConfig, MediaFetcher};
use tubedrop::logging::init_tracing;
use tubedrop::security::{LinkSigner, ensure_not_root};
use tubedrop::storage::LocalObjectStore;

const DEFAULT_PROBE_URL: &str = "https://www.youtube.com/watch?v=jNQXAC9IVRw";

#[derive(Debug, Parser)]
#[command(about = "Download one video to verify yt-dlp, cookies and ffmpeg still work")]
struct ProbeArgs {
    /// Video URL to fetch.
    #[arg(default_value = DEFAULT_PROBE_URL)]
    url: String,
    /// low, medium, high, veryhigh or mp3.
    #[arg(long, short, default_value = "low")]
    resolution: Resolution,
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    work_root: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Keep the downloaded file instead of deleting it.
    #[arg(long)]
    keep: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let args = ProbeArgs::parse();
    ensure_not_root("probe_downloader")?;

    let config = resolve_runtime_config(RuntimeOverrides {
        storage_root: args.storage_root,
        work_root: args.work_root,
        env_path: args.env_file,
        ..RuntimeOverrides::default()
    })?;

    // Links are never handed out here, so an ephemeral key is enough.
    let store = Arc::new(LocalObjectStore::new(
        &config.storage_root,
        Arc::new(LinkSigner::generate()),
        &config.public_base_url,
    ));
    let fetcher = MediaFetcher::new(
        FetcherConfig {
            yt_dlp: config.yt_dlp.clone(),
            ffmpeg: config.ffmpeg.clone(),
            timeout: config.download_timeout,
            cookies_key: config.cookies_key.clone(),
        },
        store,
    );

    std::fs::create_dir_all(&config.work_root)
        .with_context(|| format!("creating {}", config.work_root.display()))?;
    let work_dir = tempfile::Builder::new()
        .prefix("probe-")
        .tempdir_in(&config.work_root)
        .context("creating probe working directory")?;

    let artifact = fetcher
        .fetch(&args.url, args.resolution, work_dir.path())
        .await
        .with_context(|| format!("probe download of {} failed", args.url))?;
    let size = std::fs::metadata(&artifact)
        .with_context(|| format!("reading {}", artifact.display()))?
        .len();
    println!("{} ({:.2} MB)", artifact.display(), size_mb(size));

    if args.keep {
        let kept = config.work_root.join(
            artifact
                .file_name()
                .context("artifact has no file name")?,
        );
        std::fs::rename(&artifact, &kept)
            .with_context(|| format!("keeping {}", kept.display()))?;
        println!("kept at {}", kept.display());
    }
    Ok(())
}
