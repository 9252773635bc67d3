#![forbid(unsafe_code)]

//! User-facing chat texts.

pub const HELP: &str = "📚 Available commands:

/list - list your stored videos
/delete file_name.zip - delete one of your stored videos
/history - show your latest messages
/help - show this help

To download a video send:
[URL] [resolution]

Resolutions: low, medium, high, veryhigh, mp3
Example: https://www.youtube.com/watch?v=example medium";

pub const DECOY_REFUSAL: &str = "Not even worth thinking about 🤨";
pub const QUEUED: &str = "Download in progress, it's on its way... 🔄";
pub const DOWNLOAD_FAILED: &str = "Download failed 🤕 Try again!";
pub const DELETE_USAGE: &str = "Usage: /delete file_name.zip";
pub const LIST_HEADER: &str = "📋 Available videos:\n\n";
pub const LIST_EMPTY: &str = "No videos available, nothing, nada 🧹";
pub const LIST_FAILED: &str = "Could not list your videos right now, try again later.";
pub const HISTORY_EMPTY: &str = "No message history yet.";
pub const HISTORY_FAILED: &str = "Could not read your message history right now.";
pub const SEND_FAILED: &str = "Could not send the file, try again later 😕";
pub const COMPRESS_FAILED: &str = "Could not compress the file for upload 😕";
pub const UPLOAD_FAILED: &str = "Could not upload the file to storage 😕";
pub const LINK_FAILED: &str = "Could not create a download link 😕";

pub fn deleted(name: &str) -> String {
    format!("✅ Video '{name}' deleted, ciao 🫡")
}

pub fn delete_failed(name: &str) -> String {
    format!("❌ Could not delete '{name}', check the file name 🧐")
}

pub fn sending(file_name: &str, resolution: &str, size_mb: f64) -> String {
    format!("Sending '{file_name}' at resolution {resolution} ({size_mb:.2} MB), on its way... 📲")
}

pub fn link_ready(url: &str) -> String {
    format!("Here is your video 🍿\n\n{url}")
}
