#![forbid(unsafe_code)]

//! Chat-driven video download service.
//!
//! A Telegram webhook feeds [`command`] parsing; downloads are queued by
//! [`dispatch`], fetched with yt-dlp by [`fetcher`] and handed back to the
//! user by [`delivery`], either inline or through a signed storage link.

pub mod chat;
pub mod command;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod fetcher;
pub mod history;
pub mod logging;
pub mod messages;
pub mod secrets;
pub mod security;
pub mod server;
pub mod storage;
