#![forbid(unsafe_code)]

//! Webhook server: receives chat updates, answers commands and runs the
//! download worker in the same process.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::signal;
use tubedrop::chat::TelegramClient;
use tubedrop::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use tubedrop::delivery::DeliverySelector;
use tubedrop::dispatch::{JobQueue, Pipeline};
use tubedrop::fetcher::{FetcherConfig, MediaFetcher};
use tubedrop::history::{DEFAULT_HISTORY_LIMIT, HistoryStore};
use tubedrop::logging::init_tracing;
use tubedrop::secrets::{CachedSecret, DEFAULT_SECRET_TTL, EnvSecret, JsonFileSecret, SecretSource};
use tubedrop::security::{LinkSigner, ensure_not_root};
use tubedrop::server::{AppState, router};
use tubedrop::storage::LocalObjectStore;

const BOT_TOKEN_VAR: &str = "BOT_TOKEN";

#[derive(Debug, Clone, Default)]
struct ServerArgs {
    overrides: RuntimeOverrides,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = |name: &str| -> Result<String> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{name} requires a value"))
            };

            match flag.as_str() {
                "--work-root" => overrides.work_root = Some(PathBuf::from(value("--work-root")?)),
                "--storage-root" => {
                    overrides.storage_root = Some(PathBuf::from(value("--storage-root")?))
                }
                "--port" => overrides.port = Some(parse_port_arg(&value("--port")?)?),
                "--host" => overrides.host = Some(value("--host")?),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value("--env-file")?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(Self { overrides })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEDROP_HOST")
}

fn bot_token_source(config: &RuntimeConfig) -> Arc<dyn SecretSource> {
    match &config.bot_secret_file {
        Some(path) => Arc::new(CachedSecret::new(
            JsonFileSecret::new(path, config.bot_secret_key.clone()),
            DEFAULT_SECRET_TTL,
        )),
        None => Arc::new(CachedSecret::new(
            EnvSecret::new(BOT_TOKEN_VAR, config.env_path.clone()),
            DEFAULT_SECRET_TTL,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let ServerArgs { overrides } = ServerArgs::parse()?;
    ensure_not_root("tubedrop server")?;

    let config = resolve_runtime_config(overrides)?;
    let host = parse_host_arg(&config.host)?;

    let token = bot_token_source(&config);
    token
        .fetch()
        .context("bot token unavailable at startup")?;

    let signer = Arc::new(LinkSigner::load_or_create(&config.signing_key_file)?);
    let files = Arc::new(LocalObjectStore::new(
        &config.storage_root,
        signer,
        &config.public_base_url,
    ));
    let history = Arc::new(
        HistoryStore::open(&config.history_db)
            .await
            .context("initializing message history")?,
    );
    let chat = Arc::new(TelegramClient::new(&config.telegram_api, token)?);

    let fetcher = MediaFetcher::new(
        FetcherConfig {
            yt_dlp: config.yt_dlp.clone(),
            ffmpeg: config.ffmpeg.clone(),
            timeout: config.download_timeout,
            cookies_key: config.cookies_key.clone(),
        },
        files.clone(),
    );
    let delivery = DeliverySelector::new(chat.clone(), files.clone(), config.inline_limit_bytes);
    let pipeline = Arc::new(Pipeline::new(
        fetcher,
        delivery,
        chat.clone(),
        &config.work_root,
    ));

    let (queue, receiver) = JobQueue::bounded(config.queue_capacity);
    let worker = receiver.spawn(pipeline, config.max_concurrent_jobs);

    let state = AppState {
        chat,
        store: files.clone(),
        files,
        history,
        queue,
        webhook_secret: config.webhook_secret.as_deref().map(Arc::from),
        history_limit: DEFAULT_HISTORY_LIMIT,
    };
    let app = router(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, public_base_url = %config.public_base_url, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    // The router (and with it the last queue handle) is gone; let running
    // jobs finish.
    if let Err(err) = worker.await {
        tracing::error!(error = %err, "download worker stopped abnormally");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}
