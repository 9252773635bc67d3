#![forbid(unsafe_code)]

//! Size-based delivery of a downloaded artifact: small files go through the
//! chat API, large ones are zipped, stored, and linked.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chat::ChatApi;
use crate::messages;
use crate::storage::{BYTES_PER_MB, LINK_TTL, ObjectStore, StorageError, VIDEOS_BUCKET, user_namespace};

pub use crate::config::DEFAULT_INLINE_LIMIT_BYTES as INLINE_LIMIT_BYTES;

const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "m4a", "ogg", "opus", "wav"];

/// Who receives the artifact. Names only shape the storage namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub chat_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl DeliveryContext {
    pub fn namespace(&self) -> String {
        user_namespace(
            self.chat_id,
            self.first_name.as_deref(),
            self.last_name.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Inline,
    Indirect,
}

/// Strictly below the limit goes inline.
pub fn select_mode(size_bytes: u64, limit_bytes: u64) -> DeliveryMode {
    if size_bytes < limit_bytes {
        DeliveryMode::Inline
    } else {
        DeliveryMode::Indirect
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Inline,
    Linked { key: String, url: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("artifact unreadable: {0}")]
    Artifact(#[source] io::Error),
    #[error("sending to chat failed: {0:#}")]
    Send(anyhow::Error),
    #[error("compression failed: {0}")]
    Compress(String),
    #[error("upload failed: {0}")]
    Upload(#[source] StorageError),
    #[error("link generation failed: {0}")]
    Link(#[source] StorageError),
}

pub fn size_mb(size_bytes: u64) -> f64 {
    size_bytes as f64 / BYTES_PER_MB
}

pub fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|audio| ext.eq_ignore_ascii_case(audio)))
}

pub struct DeliverySelector {
    chat: Arc<dyn ChatApi>,
    store: Arc<dyn ObjectStore>,
    inline_limit: u64,
}

impl DeliverySelector {
    pub fn new(chat: Arc<dyn ChatApi>, store: Arc<dyn ObjectStore>, inline_limit: u64) -> Self {
        Self {
            chat,
            store,
            inline_limit,
        }
    }

    /// Delivers `artifact` and removes it, plus any archive made from it,
    /// before returning.
    pub async fn deliver(
        &self,
        artifact: &Path,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let archive = archive_path(artifact);
        let result = self.deliver_inner(artifact, &archive, ctx).await;

        remove_if_present(&archive).await;
        remove_if_present(artifact).await;
        result
    }

    async fn deliver_inner(
        &self,
        artifact: &Path,
        archive: &Path,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let size = tokio::fs::metadata(artifact)
            .await
            .map_err(DeliveryError::Artifact)?
            .len();
        let mode = select_mode(size, self.inline_limit);
        tracing::info!(
            chat_id = ctx.chat_id,
            artifact = %artifact.display(),
            size_mb = %format!("{:.2}", size_mb(size)),
            ?mode,
            "delivering"
        );

        match mode {
            DeliveryMode::Inline => self.send_inline(artifact, ctx).await,
            DeliveryMode::Indirect => self.send_link(artifact, archive, ctx).await,
        }
    }

    async fn send_inline(
        &self,
        artifact: &Path,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let sent = if is_audio(artifact) {
            self.chat.send_audio(ctx.chat_id, artifact).await
        } else {
            self.chat.send_video(ctx.chat_id, artifact).await
        };
        if let Err(err) = sent {
            tracing::error!(chat_id = ctx.chat_id, error = %format!("{err:#}"), "inline send failed");
            self.notify(ctx.chat_id, messages::SEND_FAILED).await;
            return Err(DeliveryError::Send(err));
        }
        Ok(DeliveryOutcome::Inline)
    }

    async fn send_link(
        &self,
        artifact: &Path,
        archive: &Path,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if let Err(err) = compress(artifact, archive).await {
            tracing::error!(chat_id = ctx.chat_id, error = %err, "compression failed");
            self.notify(ctx.chat_id, messages::COMPRESS_FAILED).await;
            return Err(DeliveryError::Compress(err));
        }

        let archive_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = format!("{}/{archive_name}", ctx.namespace());
        if let Err(err) = self.store.put_file(VIDEOS_BUCKET, &key, archive).await {
            tracing::error!(chat_id = ctx.chat_id, key = %key, error = %err, "upload failed");
            self.notify(ctx.chat_id, messages::UPLOAD_FAILED).await;
            return Err(DeliveryError::Upload(err));
        }

        let url = match self.store.presign_get(VIDEOS_BUCKET, &key, LINK_TTL).await {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(chat_id = ctx.chat_id, key = %key, error = %err, "link generation failed");
                self.notify(ctx.chat_id, messages::LINK_FAILED).await;
                return Err(DeliveryError::Link(err));
            }
        };

        self.chat
            .send_message(ctx.chat_id, &messages::link_ready(&url))
            .await
            .map_err(DeliveryError::Send)?;
        tracing::info!(chat_id = ctx.chat_id, key = %key, "retrieval link sent");
        Ok(DeliveryOutcome::Linked { key, url })
    }

    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.chat.send_message(chat_id, text).await {
            tracing::warn!(chat_id, error = %format!("{err:#}"), "failure notice not delivered");
        }
    }
}

/// `{stem}.zip` next to the artifact.
pub fn archive_path(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    artifact.with_file_name(format!("{stem}.zip"))
}

async fn compress(source: &Path, archive: &Path) -> Result<(), String> {
    let source = source.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || zip_single_file(&source, &archive))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

fn zip_single_file(source: &Path, archive: &Path) -> zip::result::ZipResult<()> {
    let entry_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    let size = fs::metadata(source)?.len();

    let file = fs::File::create(archive)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(size >= u64::from(u32::MAX));
    zip.start_file(entry_name, options)?;
    let mut input = fs::File::open(source)?;
    io::copy(&mut input, &mut zip)?;
    zip.finish()?;
    Ok(())
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not remove delivery file")
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::chat::ChatApi;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Message(i64, String),
        Video(i64, PathBuf),
        Audio(i64, PathBuf),
    }

    /// Records every outbound call; optionally fails media sends.
    #[derive(Default)]
    pub struct RecordingChat {
        pub sent: Mutex<Vec<Sent>>,
        pub fail_media: bool,
    }

    impl RecordingChat {
        pub fn messages(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|sent| match sent {
                    Sent::Message(_, text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChatApi for RecordingChat {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().push(Sent::Message(chat_id, text.to_string()));
            Ok(())
        }

        async fn send_video(&self, chat_id: i64, path: &Path) -> Result<()> {
            if self.fail_media {
                bail!("413 Request Entity Too Large");
            }
            self.sent.lock().push(Sent::Video(chat_id, path.to_path_buf()));
            Ok(())
        }

        async fn send_audio(&self, chat_id: i64, path: &Path) -> Result<()> {
            if self.fail_media {
                bail!("413 Request Entity Too Large");
            }
            self.sent.lock().push(Sent::Audio(chat_id, path.to_path_buf()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{RecordingChat, Sent};
    use super::*;
    use crate::security::LinkSigner;
    use crate::storage::LocalObjectStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put_file(&self, _: &str, _: &str, _: &Path) -> Result<(), StorageError> {
            Err(StorageError::Io(io::Error::other("disk full")))
        }
        async fn get_file(&self, bucket: &str, key: &str, _: &Path) -> Result<(), StorageError> {
            Err(StorageError::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            })
        }
        async fn list(&self, _: &str, _: &str) -> Result<Vec<crate::storage::ObjectInfo>, StorageError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn presign_get(&self, _: &str, _: &str, _: Duration) -> Result<String, StorageError> {
            Err(StorageError::Link("unreachable".into()))
        }
    }

    /// Uploads for real but cannot sign links.
    struct UnsignableStore {
        inner: Arc<LocalObjectStore>,
    }

    #[async_trait]
    impl ObjectStore for UnsignableStore {
        async fn put_file(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StorageError> {
            self.inner.put_file(bucket, key, source).await
        }
        async fn get_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError> {
            self.inner.get_file(bucket, key, dest).await
        }
        async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<crate::storage::ObjectInfo>, StorageError> {
            self.inner.list(bucket, prefix).await
        }
        async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(bucket, key).await
        }
        async fn presign_get(&self, _: &str, _: &str, _: Duration) -> Result<String, StorageError> {
            Err(StorageError::Link("signing key unavailable".into()))
        }
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            chat_id: 42,
            first_name: Some("Ann".into()),
            last_name: None,
        }
    }

    fn local_store(root: &Path) -> Arc<LocalObjectStore> {
        Arc::new(LocalObjectStore::new(
            root,
            Arc::new(LinkSigner::from_seed([3u8; 32])),
            "https://dl.example.com",
        ))
    }

    fn write_artifact(dir: &Path, name: &str, len: usize) -> Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, vec![b'v'; len])?;
        Ok(path)
    }

    #[test]
    fn limit_is_strict() {
        assert_eq!(select_mode(0, INLINE_LIMIT_BYTES), DeliveryMode::Inline);
        assert_eq!(select_mode(INLINE_LIMIT_BYTES - 1, INLINE_LIMIT_BYTES), DeliveryMode::Inline);
        assert_eq!(select_mode(INLINE_LIMIT_BYTES, INLINE_LIMIT_BYTES), DeliveryMode::Indirect);
        assert_eq!(select_mode(INLINE_LIMIT_BYTES + 1, INLINE_LIMIT_BYTES), DeliveryMode::Indirect);
    }

    #[test]
    fn archive_sits_next_to_artifact() {
        assert_eq!(
            archive_path(Path::new("/work/job-1/My Clip.mp4")),
            PathBuf::from("/work/job-1/My Clip.zip")
        );
    }

    #[test]
    fn audio_detection_uses_extension() {
        assert!(is_audio(Path::new("song.MP3")));
        assert!(is_audio(Path::new("song.m4a")));
        assert!(!is_audio(Path::new("clip.mp4")));
        assert!(!is_audio(Path::new("noext")));
    }

    #[tokio::test]
    async fn small_video_goes_inline_and_is_removed() -> Result<()> {
        let dir = tempdir()?;
        let artifact = write_artifact(dir.path(), "clip.mp4", 1024)?;
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), local_store(&dir.path().join("s")), 4096);

        let outcome = selector.deliver(&artifact, &ctx()).await?;
        assert_eq!(outcome, DeliveryOutcome::Inline);
        assert_eq!(*chat.sent.lock(), vec![Sent::Video(42, artifact.clone())]);
        assert!(!artifact.exists());
        Ok(())
    }

    #[tokio::test]
    async fn small_mp3_uses_audio_transport() -> Result<()> {
        let dir = tempdir()?;
        let artifact = write_artifact(dir.path(), "song.mp3", 10)?;
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), local_store(&dir.path().join("s")), 4096);

        selector.deliver(&artifact, &ctx()).await?;
        assert_eq!(*chat.sent.lock(), vec![Sent::Audio(42, artifact.clone())]);
        Ok(())
    }

    #[tokio::test]
    async fn inline_failure_notifies_and_cleans_up() -> Result<()> {
        let dir = tempdir()?;
        let artifact = write_artifact(dir.path(), "clip.mp4", 10)?;
        let chat = Arc::new(RecordingChat {
            fail_media: true,
            ..Default::default()
        });
        let selector = DeliverySelector::new(chat.clone(), local_store(&dir.path().join("s")), 4096);

        let err = selector.deliver(&artifact, &ctx()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Send(_)));
        assert_eq!(chat.messages(), vec![messages::SEND_FAILED.to_string()]);
        assert!(!artifact.exists());
        Ok(())
    }

    #[tokio::test]
    async fn artifact_at_limit_is_zipped_uploaded_and_linked() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path().join("work");
        fs::create_dir_all(&work)?;
        let artifact = write_artifact(&work, "Big Clip.mp4", 4096)?;
        let store = local_store(&dir.path().join("storage"));
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), store.clone(), 4096);

        let outcome = selector.deliver(&artifact, &ctx()).await?;
        let DeliveryOutcome::Linked { key, url } = outcome else {
            panic!("expected a link delivery");
        };
        assert_eq!(key, "42_Ann/Big Clip.zip");
        assert!(url.starts_with("https://dl.example.com/files/videos/42_Ann/Big%20Clip.zip?"));
        assert_eq!(chat.messages(), vec![messages::link_ready(&url)]);

        let stored = store.object_path(VIDEOS_BUCKET, &key)?;
        let mut archive = zip::ZipArchive::new(fs::File::open(stored)?)?;
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0)?.name(), "Big Clip.mp4");

        assert!(!artifact.exists());
        assert!(!work.join("Big Clip.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn upload_failure_has_its_own_message_and_skips_link() -> Result<()> {
        let dir = tempdir()?;
        let artifact = write_artifact(dir.path(), "clip.mp4", 100)?;
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), Arc::new(FailingStore), 10);

        let err = selector.deliver(&artifact, &ctx()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Upload(_)));
        assert_eq!(chat.messages(), vec![messages::UPLOAD_FAILED.to_string()]);
        assert!(!artifact.exists());
        assert!(!dir.path().join("clip.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn link_failure_has_its_own_message_and_cleans_up() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path().join("work");
        fs::create_dir_all(&work)?;
        let artifact = write_artifact(&work, "clip.mp4", 100)?;
        let store = local_store(&dir.path().join("storage"));
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(
            chat.clone(),
            Arc::new(UnsignableStore { inner: store.clone() }),
            10,
        );

        let err = selector.deliver(&artifact, &ctx()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Link(_)));
        assert_eq!(chat.messages(), vec![messages::LINK_FAILED.to_string()]);
        assert!(store.object_path(VIDEOS_BUCKET, "42_Ann/clip.zip")?.exists());
        assert!(!artifact.exists());
        assert!(!work.join("clip.zip").exists());
        assert_eq!(fs::read_dir(&work)?.count(), 0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compression_failure_has_its_own_message_and_cleans_up() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path().join("work");
        fs::create_dir_all(&work)?;
        // Passes the size check but cannot be read as a file.
        let unreadable = dir.path().join("not-a-file");
        fs::create_dir_all(&unreadable)?;
        fs::write(unreadable.join("frame.bin"), b"x")?;
        let artifact = work.join("clip.mp4");
        std::os::unix::fs::symlink(&unreadable, &artifact)?;
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), local_store(&dir.path().join("s")), 1);

        let err = selector.deliver(&artifact, &ctx()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Compress(_)));
        assert_eq!(chat.messages(), vec![messages::COMPRESS_FAILED.to_string()]);
        assert_eq!(fs::read_dir(&work)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let chat = Arc::new(RecordingChat::default());
        let selector = DeliverySelector::new(chat.clone(), Arc::new(FailingStore), 10);
        let err = selector
            .deliver(&dir.path().join("gone.mp4"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Artifact(_)));
        assert!(chat.sent.lock().is_empty());
        Ok(())
    }
}
