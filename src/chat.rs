#![forbid(unsafe_code)]

//! Telegram Bot API: inbound update parsing and outbound messaging.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::secrets::SecretSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_CHARS: usize = 300;

/// A text message received from a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<UpdateMessage>,
    edited_message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    chat: UpdateChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateChat {
    id: i64,
    first_name: Option<String>,
    last_name: Option<String>,
}

/// Extracts the text message from a webhook body, preferring `message` over
/// `edited_message`. Returns `None` for anything without a chat id and text.
pub fn parse_update(body: &[u8]) -> Option<InboundMessage> {
    let update: Update = serde_json::from_slice(body).ok()?;
    let message = update.message.or(update.edited_message)?;
    Some(InboundMessage {
        chat_id: message.chat.id,
        text: message.text?,
        first_name: message.chat.first_name.filter(|name| !name.is_empty()),
        last_name: message.chat.last_name.filter(|name| !name.is_empty()),
    })
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;

    async fn send_video(&self, chat_id: i64, path: &Path) -> Result<()>;

    async fn send_audio(&self, chat_id: i64, path: &Path) -> Result<()>;
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: Arc<dyn SecretSource>,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: Arc<dyn SecretSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn api_url(&self, method: &str) -> Result<String> {
        let token = self.token.fetch().context("retrieving bot token")?;
        Ok(method_url(&self.api_base, token.expose_secret(), method))
    }

    async fn send_file(&self, chat_id: i64, path: &Path, method: &str, field: &str) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("media")
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(mime.essence_str())
            .context("setting attachment content type")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);

        let response = self
            .http
            .post(self.api_url(method)?)
            .multipart(form)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("Telegram {method} request failed: {}", err.without_url()))?;
        ensure_ok(method, response).await?;
        tracing::info!(chat_id, file_name = %file_name, method, "file sent");
        Ok(())
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let response = self
            .http
            .post(self.api_url("sendMessage")?)
            .json(&body)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("Telegram sendMessage request failed: {}", err.without_url()))?;
        ensure_ok("sendMessage", response).await
    }

    async fn send_video(&self, chat_id: i64, path: &Path) -> Result<()> {
        self.send_file(chat_id, path, "sendVideo", "video").await
    }

    async fn send_audio(&self, chat_id: i64, path: &Path) -> Result<()> {
        self.send_file(chat_id, path, "sendAudio", "audio").await
    }
}

fn method_url(api_base: &str, token: &str, method: &str) -> String {
    format!("{api_base}/bot{token}/{method}")
}

async fn ensure_ok(method: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    bail!("Telegram {method} failed with {status}: {}", sanitize_error(&body))
}

/// Shortens an API error body and drops anything that looks like a bot token.
fn sanitize_error(body: &str) -> String {
    let cleaned: Vec<&str> = body
        .split_whitespace()
        .map(|word| if looks_like_token(word) { "[REDACTED]" } else { word })
        .collect();
    let joined = cleaned.join(" ");
    match joined.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => format!("{}...", &joined[..cut]),
        None => joined,
    }
}

fn looks_like_token(word: &str) -> bool {
    let word = word.trim_start_matches("/bot");
    let Some((id, secret)) = word.split_once(':') else {
        return false;
    };
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && secret.len() >= 20
}
