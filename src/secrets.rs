#![forbid(unsafe_code)]

//! Bot-token retrieval. The token is looked up through a [`SecretSource`] and
//! cached by [`CachedSecret`] so webhook bursts do not hit the backing store on
//! every request.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{env_var_string, lookup_value, read_env_file};

pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(5 * 60);

pub trait SecretSource: Send + Sync {
    fn fetch(&self) -> Result<SecretString>;
}

/// Reads a JSON document such as `{"bot_token": "..."}` and extracts one key.
pub struct JsonFileSecret {
    path: PathBuf,
    key: String,
}

impl JsonFileSecret {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }
}

impl SecretSource for JsonFileSecret {
    fn fetch(&self) -> Result<SecretString> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading secret file {}", self.path.display()))?;
        let document: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing secret file {}", self.path.display()))?;
        let value = document
            .get(&self.key)
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("secret key {} missing from {}", self.key, self.path.display()))?;
        Ok(SecretString::from(value.to_string()))
    }
}

/// Looks the secret up in the process environment, then in the `.env` file.
/// The file is re-read on each fetch so rotations are picked up once the
/// cache expires.
pub struct EnvSecret {
    var: String,
    env_path: PathBuf,
}

impl EnvSecret {
    pub fn new(var: impl Into<String>, env_path: impl Into<PathBuf>) -> Self {
        Self {
            var: var.into(),
            env_path: env_path.into(),
        }
    }
}

impl SecretSource for EnvSecret {
    fn fetch(&self) -> Result<SecretString> {
        let file_vars = read_env_file(&self.env_path)?;
        lookup_value(&self.var, &file_vars, &env_var_string)
            .map(SecretString::from)
            .ok_or_else(|| anyhow!("{} not set", self.var))
    }
}

/// Caches another source's value for `ttl`. Failed fetches are not cached.
pub struct CachedSecret<S> {
    inner: S,
    ttl: Duration,
    cached: RwLock<Option<(SecretString, Instant)>>,
}

impl<S: SecretSource> CachedSecret<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn invalidate(&self) {
        self.cached.write().take();
    }
}

impl<S: SecretSource> SecretSource for CachedSecret<S> {
    fn fetch(&self) -> Result<SecretString> {
        if let Some((value, fetched_at)) = self.cached.read().as_ref()
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(duplicate(value));
        }

        let value = self.inner.fetch()?;
        *self.cached.write() = Some((duplicate(&value), Instant::now()));
        Ok(value)
    }
}

impl SecretSource for SecretString {
    fn fetch(&self) -> Result<SecretString> {
        Ok(duplicate(self))
    }
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    impl SecretSource for CountingSource {
        fn fetch(&self) -> Result<SecretString> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SecretString::from(format!("token-{n}")))
        }
    }

    #[test]
    fn json_file_secret_extracts_key() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("secret.json");
        fs::write(&path, r#"{"bot_token": " 123:ABC ", "other": 1}"#)?;
        let secret = JsonFileSecret::new(&path, "bot_token").fetch()?;
        assert_eq!(secret.expose_secret(), "123:ABC");
        Ok(())
    }

    #[test]
    fn json_file_secret_reports_missing_key() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("secret.json");
        fs::write(&path, r#"{"other": "x"}"#)?;
        let err = JsonFileSecret::new(&path, "bot_token").fetch().unwrap_err();
        assert!(err.to_string().contains("bot_token"));
        Ok(())
    }

    #[test]
    fn env_secret_falls_back_to_env_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(".env");
        fs::write(&path, "TUBEDROP_TEST_ONLY_TOKEN=\"from-file\"\n")?;
        let secret = EnvSecret::new("TUBEDROP_TEST_ONLY_TOKEN", &path).fetch()?;
        assert_eq!(secret.expose_secret(), "from-file");
        Ok(())
    }

    #[test]
    fn cached_secret_reuses_value_within_ttl() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedSecret::new(
            CountingSource {
                calls: calls.clone(),
            },
            Duration::from_secs(60),
        );
        assert_eq!(cached.fetch()?.expose_secret(), "token-0");
        assert_eq!(cached.fetch()?.expose_secret(), "token-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cached.invalidate();
        assert_eq!(cached.fetch()?.expose_secret(), "token-1");
        Ok(())
    }

    #[test]
    fn cached_secret_refreshes_after_ttl() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedSecret::new(
            CountingSource {
                calls: calls.clone(),
            },
            Duration::ZERO,
        );
        cached.fetch()?;
        cached.fetch()?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
