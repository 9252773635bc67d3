#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_TUBEDROP_PORT: u16 = 8080;
pub const DEFAULT_TUBEDROP_HOST: &str = "127.0.0.1";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_INLINE_LIMIT_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_BOT_SECRET_KEY: &str = "bot_token";
pub const DEFAULT_COOKIES_KEY: &str = "youtube_cookies.txt";
pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

const HISTORY_DB_FILE: &str = "history.db";
const SIGNING_KEY_FILE: &str = "link-signing.key";
const WORK_SUBDIR: &str = "tubedrop-work";

/// Everything the service needs at runtime, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub work_root: PathBuf,
    pub storage_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    pub yt_dlp: PathBuf,
    pub ffmpeg: Option<PathBuf>,
    pub download_timeout: Duration,
    pub history_db: PathBuf,
    pub cookies_key: String,
    pub bot_secret_file: Option<PathBuf>,
    pub bot_secret_key: String,
    pub telegram_api: String,
    pub webhook_secret: Option<String>,
    pub signing_key_file: PathBuf,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    /// Artifacts strictly smaller than this are sent through the chat API.
    pub inline_limit_bytes: u64,
    pub env_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub work_root: Option<PathBuf>,
    pub storage_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides, env_path)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
    env_path: PathBuf,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let storage_root = overrides
        .storage_root
        .or_else(|| lookup("STORAGE_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("STORAGE_ROOT not set"))?;
    let work_root = overrides
        .work_root
        .or_else(|| lookup("WORK_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join(WORK_SUBDIR));
    let port = overrides
        .port
        .or_else(|| lookup("TUBEDROP_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_TUBEDROP_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEDROP_HOST"))
        .unwrap_or_else(|| DEFAULT_TUBEDROP_HOST.to_string());
    let public_base_url = lookup("PUBLIC_BASE_URL")
        .unwrap_or_else(|| format!("http://{host}:{port}"))
        .trim_end_matches('/')
        .to_string();
    let download_timeout = lookup("DOWNLOAD_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS));
    let max_concurrent_jobs = parse_positive(lookup("MAX_CONCURRENT_JOBS"))
        .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
    let queue_capacity =
        parse_positive(lookup("QUEUE_CAPACITY")).unwrap_or(DEFAULT_QUEUE_CAPACITY);
    let inline_limit_bytes = lookup("INLINE_LIMIT_BYTES")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_INLINE_LIMIT_BYTES);

    Ok(RuntimeConfig {
        history_db: lookup("HISTORY_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_root.join(HISTORY_DB_FILE)),
        signing_key_file: lookup("LINK_SIGNING_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_root.join(SIGNING_KEY_FILE)),
        yt_dlp: lookup("YT_DLP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP)),
        ffmpeg: lookup("FFMPEG_PATH").map(PathBuf::from),
        cookies_key: lookup("COOKIES_KEY").unwrap_or_else(|| DEFAULT_COOKIES_KEY.to_string()),
        bot_secret_file: lookup("BOT_SECRET_FILE").map(PathBuf::from),
        bot_secret_key: lookup("BOT_SECRET_KEY")
            .unwrap_or_else(|| DEFAULT_BOT_SECRET_KEY.to_string()),
        telegram_api: lookup("TELEGRAM_API_URL")
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API.to_string())
            .trim_end_matches('/')
            .to_string(),
        webhook_secret: lookup("WEBHOOK_SECRET"),
        work_root,
        storage_root,
        host,
        port,
        public_base_url,
        download_timeout,
        max_concurrent_jobs,
        queue_capacity,
        inline_limit_bytes,
        env_path,
    })
}

fn parse_positive(value: Option<String>) -> Option<usize> {
    value
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

pub(crate) fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Process environment wins over the `.env` file; blank file values count as
/// unset.
pub(crate) fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
