#![forbid(unsafe_code)]

//! Classifies chat text into the bot's command surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const LIST_COMMAND: &str = "/list";
const DELETE_COMMAND: &str = "/delete";
const HELP_COMMAND: &str = "/help";
const START_COMMAND: &str = "/start";
const HISTORY_COMMAND: &str = "/history";

/// Video id that is always refused, whatever the URL shape around it.
pub const DECOY_VIDEO_ID: &str = "dQw4w9WgXcQ";

/// Requested download quality. `Mp3` switches the fetcher to audio-only
/// extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Low,
    Medium,
    High,
    VeryHigh,
    Mp3,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::Low,
        Resolution::Medium,
        Resolution::High,
        Resolution::VeryHigh,
        Resolution::Mp3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "veryhigh",
            Self::Mp3 => "mp3",
        }
    }

    /// yt-dlp `--format` selector for this resolution.
    pub fn format_selector(self) -> &'static str {
        match self {
            Self::Low => "bestvideo[height<=240][ext=mp4]+bestaudio",
            Self::Medium => "bestvideo[height<=480][ext=mp4]+bestaudio",
            Self::High => "bestvideo[height<=720][ext=mp4]+bestaudio",
            Self::VeryHigh => "bestvideo[height<=1080][ext=mp4]+bestaudio",
            Self::Mp3 => "bestaudio",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3)
    }

    /// Extension of the file yt-dlp leaves behind for this resolution.
    pub fn output_extension(self) -> &'static str {
        if self.is_audio() { "mp3" } else { "mp4" }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownResolution(pub String);

impl fmt::Display for UnknownResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown resolution: {}", self.0)
    }
}

impl std::error::Error for UnknownResolution {}

impl FromStr for Resolution {
    type Err = UnknownResolution;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "veryhigh" => Ok(Self::VeryHigh),
            "mp3" => Ok(Self::Mp3),
            _ => Err(UnknownResolution(value.to_string())),
        }
    }
}

/// Why a message could not be turned into a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Not a command and not a `<url> <resolution>` pair.
    Usage,
    UnknownResolution,
    /// The URL points at the refused video.
    Decoy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandIntent {
    List,
    /// File name to delete; empty when the user omitted it.
    Delete(String),
    Help,
    History,
    Download { url: String, resolution: Resolution },
    Invalid(Rejection),
}

/// Classifies a message. Prefix commands are checked in priority order before
/// the two-token download form.
pub fn parse_command(text: &str) -> CommandIntent {
    let text = text.trim();

    if text.starts_with(LIST_COMMAND) {
        return CommandIntent::List;
    }
    if text.starts_with(DELETE_COMMAND) {
        // Only the first whitespace run separates the command: file names may
        // contain spaces.
        let name = text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or_default();
        return CommandIntent::Delete(name.to_string());
    }
    if text.starts_with(HELP_COMMAND) || text.starts_with(START_COMMAND) {
        return CommandIntent::Help;
    }
    if text.starts_with(HISTORY_COMMAND) {
        return CommandIntent::History;
    }

    let parts: Vec<&str> = text.split_whitespace().collect();
    let [url, resolution] = parts.as_slice() else {
        return CommandIntent::Invalid(Rejection::Usage);
    };

    if is_decoy(url) {
        return CommandIntent::Invalid(Rejection::Decoy);
    }

    match resolution.parse::<Resolution>() {
        Ok(resolution) => CommandIntent::Download {
            url: (*url).to_string(),
            resolution,
        },
        Err(_) => CommandIntent::Invalid(Rejection::UnknownResolution),
    }
}

pub fn is_decoy(url: &str) -> bool {
    url.contains(DECOY_VIDEO_ID)
}
