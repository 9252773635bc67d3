#![forbid(unsafe_code)]

//! Object storage used for large deliveries and the downloader's cookie jar.
//!
//! [`ObjectStore`] is the narrow contract the pipeline relies on.
//! [`LocalObjectStore`] keeps buckets as directories under a storage root and
//! hands out links signed with [`LinkSigner`]; the HTTP server verifies and
//! serves them.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use walkdir::WalkDir;

use crate::security::LinkSigner;

pub const VIDEOS_BUCKET: &str = "videos";
pub const COOKIES_BUCKET: &str = "cookies";
/// Lifetime of retrieval links sent to users.
pub const LINK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const NAMESPACE_DELIMITER: char = '_';
const UPLOAD_SUFFIX: &str = ".uploading";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("cannot build link: {0}")]
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

impl ObjectInfo {
    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        file_name_of(&self.key)
    }

    pub fn size_mb(&self) -> f64 {
        self.size as f64 / BYTES_PER_MB
    }
}

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StorageError>;

    async fn get_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError>;

    /// Objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Returns `false` when the object did not exist.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// Time-bounded retrieval URL for an existing object.
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration)
    -> Result<String, StorageError>;
}

/// Per-user key prefix: `{chat_id}[_{first_name}][_{last_name}]`.
pub fn user_namespace(chat_id: i64, first_name: Option<&str>, last_name: Option<&str>) -> String {
    let mut namespace = chat_id.to_string();
    for part in [first_name, last_name].into_iter().flatten() {
        let part = sanitize_segment(part);
        if !part.is_empty() {
            namespace.push(NAMESPACE_DELIMITER);
            namespace.push_str(&part);
        }
    }
    namespace
}

/// True when the first key segment belongs to `chat_id`, whatever display
/// name was current when the object was stored.
pub fn belongs_to_chat(key: &str, chat_id: i64) -> bool {
    let Some((namespace, _)) = key.split_once('/') else {
        return false;
    };
    let id = chat_id.to_string();
    namespace == id
        || namespace
            .strip_prefix(&id)
            .is_some_and(|rest| rest.starts_with(NAMESPACE_DELIMITER))
}

pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Display names end up in object keys; keep them to one printable segment.
fn sanitize_segment(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' => '-',
            ch if ch.is_control() => '-',
            ch => ch,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Filesystem-backed buckets with signed retrieval links.
pub struct LocalObjectStore {
    root: PathBuf,
    signer: Arc<LinkSigner>,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, signer: Arc<LinkSigner>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            signer,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Maps `bucket/key` to a path under the root, refusing anything that
    /// could escape it.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_relative(bucket)?;
        validate_relative(key)?;
        if bucket.contains('/') {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket).join(key))
    }

    pub fn verify_link(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> bool {
        self.signer
            .verify(bucket, key, expires, signature, Utc::now().timestamp())
    }

    fn link_for(&self, bucket: &str, key: &str, expires: i64) -> Result<String, StorageError> {
        let mut url = Url::parse(&self.public_base_url)
            .map_err(|err| StorageError::Link(format!("{}: {err}", self.public_base_url)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Link(format!("{} cannot be a base", self.public_base_url)))?
            .pop_if_empty()
            .push("files")
            .push(bucket)
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.signer.sign(bucket, key, expires));
        Ok(url.into())
    }
}

fn validate_relative(value: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidKey(value.to_string());
    if value.is_empty() || value.contains('\\') || value.ends_with(UPLOAD_SUFFIX) {
        return Err(invalid());
    }
    for component in Path::new(value).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    if value.split('/').any(str::is_empty) {
        return Err(invalid());
    }
    Ok(())
}

fn not_found_or_io(err: io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StorageError> {
        let target = self.object_path(bucket, key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut staging = target.clone().into_os_string();
        staging.push(UPLOAD_SUFFIX);
        let staging = PathBuf::from(staging);
        if let Err(err) = tokio::fs::copy(source, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        tokio::fs::rename(&staging, &target).await?;
        tracing::debug!(bucket, key, "stored object");
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError> {
        let source = self.object_path(bucket, key)?;
        tokio::fs::copy(&source, dest)
            .await
            .map_err(|err| not_found_or_io(err, bucket, key))?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        validate_relative(bucket)?;
        let bucket_root = self.root.join(bucket);
        let prefix = prefix.to_string();
        let objects = tokio::task::spawn_blocking(move || collect_objects(&bucket_root, &prefix))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))??;
        Ok(objects)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(bucket, key, "deleted object");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::metadata(&path)
            .await
            .map_err(|err| not_found_or_io(err, bucket, key))?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl_secs);
        self.link_for(bucket, key, expires)
    }
}

fn collect_objects(bucket_root: &Path, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
    if !bucket_root.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(bucket_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let Ok(relative) = entry.path().strip_prefix(bucket_root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.ends_with(UPLOAD_SUFFIX) || !key.starts_with(prefix) {
            continue;
        }
        let metadata = entry.metadata().map_err(|err| {
            StorageError::Io(err.into_io_error().unwrap_or_else(|| io::Error::other("walkdir")))
        })?;
        objects.push(ObjectInfo {
            key,
            size: metadata.len(),
        });
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path) -> LocalObjectStore {
        LocalObjectStore::new(
            root,
            Arc::new(LinkSigner::from_seed([3u8; 32])),
            "https://dl.example.com/",
        )
    }

    #[test]
    fn namespace_joins_present_names() {
        assert_eq!(user_namespace(42, Some("Ann"), Some("Lee")), "42_Ann_Lee");
        assert_eq!(user_namespace(42, None, Some("Lee")), "42_Lee");
        assert_eq!(user_namespace(42, Some("  "), None), "42");
        assert_eq!(user_namespace(-100, Some("a/b"), None), "-100_a-b");
    }

    #[test]
    fn belongs_to_chat_matches_id_prefix_only() {
        assert!(belongs_to_chat("42/a.zip", 42));
        assert!(belongs_to_chat("42_Ann_Lee/a.zip", 42));
        assert!(!belongs_to_chat("421/a.zip", 42));
        assert!(!belongs_to_chat("4_Ann/a.zip", 42));
        assert!(!belongs_to_chat("42", 42));
    }

    #[test]
    fn object_path_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.object_path("videos", "../etc/passwd").is_err());
        assert!(store.object_path("videos", "/abs").is_err());
        assert!(store.object_path("videos", "a//b").is_err());
        assert!(store.object_path("../x", "a").is_err());
        assert!(store.object_path("videos", "42_Ann/My Clip.zip").is_ok());
    }

    #[tokio::test]
    async fn put_list_get_delete_cycle() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(&dir.path().join("storage"));
        let source = dir.path().join("clip.zip");
        std::fs::write(&source, vec![0u8; 2048])?;

        store.put_file(VIDEOS_BUCKET, "42_Ann/clip.zip", &source).await?;
        store.put_file(VIDEOS_BUCKET, "7/other.zip", &source).await?;

        let listed = store.list(VIDEOS_BUCKET, "42").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "42_Ann/clip.zip");
        assert_eq!(listed[0].file_name(), "clip.zip");
        assert_eq!(listed[0].size, 2048);

        let copy = dir.path().join("copy.zip");
        store.get_file(VIDEOS_BUCKET, "42_Ann/clip.zip", &copy).await?;
        assert_eq!(std::fs::metadata(&copy)?.len(), 2048);

        assert!(store.delete(VIDEOS_BUCKET, "42_Ann/clip.zip").await?);
        assert!(!store.delete(VIDEOS_BUCKET, "42_Ann/clip.zip").await?);
        assert!(store.list(VIDEOS_BUCKET, "42").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_of_missing_bucket_is_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert!(store(dir.path()).list(VIDEOS_BUCKET, "").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_object_reports_not_found() {
        let dir = tempdir().unwrap();
        let err = store(dir.path())
            .get_file(COOKIES_BUCKET, "youtube_cookies.txt", &dir.path().join("c.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn presigned_link_verifies_and_encodes_key() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let source = dir.path().join("src.bin");
        std::fs::write(&source, b"data")?;
        store.put_file(VIDEOS_BUCKET, "42_Ann/My Clip.zip", &source).await?;

        let link = store
            .presign_get(VIDEOS_BUCKET, "42_Ann/My Clip.zip", LINK_TTL)
            .await?;
        let url = Url::parse(&link)?;
        assert_eq!(url.path(), "/files/videos/42_Ann/My%20Clip.zip");

        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let expires: i64 = query["expires"].parse()?;
        let remaining = expires - Utc::now().timestamp();
        assert!(remaining > LINK_TTL.as_secs() as i64 - 60);
        assert!(remaining <= LINK_TTL.as_secs() as i64);
        assert!(store.verify_link(VIDEOS_BUCKET, "42_Ann/My Clip.zip", expires, &query["signature"]));
        assert!(!store.verify_link(VIDEOS_BUCKET, "42_Ann/Other.zip", expires, &query["signature"]));
        Ok(())
    }

    #[tokio::test]
    async fn presign_missing_object_fails() {
        let dir = tempdir().unwrap();
        let err = store(dir.path())
            .presign_get(VIDEOS_BUCKET, "42/none.zip", LINK_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
