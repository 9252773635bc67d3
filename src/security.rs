#![forbid(unsafe_code)]

//! Process guards and the signer behind time-bounded retrieval links.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use nix::unistd::Uid;
use rand_core::OsRng;

/// Fails fast when a binary is started as root. The service shells out to
/// yt-dlp with attacker-chosen URLs, so it must run unprivileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Signs `(bucket, key, expiry)` triples so storage objects can be fetched
/// without credentials until the link expires.
pub struct LinkSigner {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl LinkSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_seed(signing.to_bytes())
    }

    /// Reads the base64 seed at `path`, creating it on first start.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading signing key {}", path.display()))?;
            let bytes = URL_SAFE_NO_PAD
                .decode(raw.trim())
                .with_context(|| format!("decoding signing key {}", path.display()))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("signing key {} must hold 32 bytes", path.display()))?;
            return Ok(Self::from_seed(seed));
        }

        let signer = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, URL_SAFE_NO_PAD.encode(signer.signing.to_bytes()))
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        restrict_permissions(&tmp_path)?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("persisting signing key {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new link signing key");
        Ok(signer)
    }

    pub fn sign(&self, bucket: &str, key: &str, expires: i64) -> String {
        let signature = self.signing.sign(signing_payload(bucket, key, expires).as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    /// Checks the signature and that `expires` is still in the future
    /// relative to `now` (both unix seconds).
    pub fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str, now: i64) -> bool {
        if expires <= now {
            return false;
        }
        let Ok(bytes) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        self.verifying
            .verify(signing_payload(bucket, key, expires).as_bytes(), &signature)
            .is_ok()
    }
}

fn signing_payload(bucket: &str, key: &str, expires: i64) -> String {
    format!("{bucket}\n{key}\n{expires}")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
