//! Host identity provider
//!
//! Loads the configured host key, or generates an Ed25519 key once and keeps
//! it under the cache directory so clients that pinned it keep trusting us.

use crate::{Error, Result};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Subdirectory of the cache directory holding generated keys
pub const HOST_KEY_DIR: &str = "serve-sftp";

/// File name of the generated key
pub const HOST_KEY_FILE: &str = "id_ed25519";

/// Where the generated key lives for a given cache directory
pub fn cached_key_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(HOST_KEY_DIR).join(HOST_KEY_FILE)
}

/// Resolve the server's host key
///
/// # Errors
///
/// `KeyLoad` when a key file exists (or is configured) but cannot be read,
/// `KeyGen` when a new key cannot be generated or persisted.
pub fn get_host_key(configured: Option<&Path>, cache_dir: Option<&Path>) -> Result<PrivateKey> {
    if let Some(path) = configured {
        let key = load_key(path)?;
        info!(
            event = "host_key_loaded",
            path = %path.display(),
            fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "Loaded host key"
        );
        return Ok(key);
    }

    let cache_dir = cache_dir.ok_or_else(|| {
        Error::KeyGen("no cache directory available to store a generated host key".to_string())
    })?;
    let path = cached_key_path(cache_dir);

    if path.exists() {
        let key = load_key(&path)?;
        info!(
            event = "host_key_loaded",
            path = %path.display(),
            fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "Loaded cached host key"
        );
        return Ok(key);
    }

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| Error::KeyGen(e.to_string()))?;
    persist_key(&key, &path)?;
    info!(
        event = "host_key_generated",
        path = %path.display(),
        fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
        "Generated new host key"
    );
    Ok(key)
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None).map_err(|e| Error::KeyLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn persist_key(key: &PrivateKey, path: &Path) -> Result<()> {
    let keygen = |context: &str, e: &dyn std::fmt::Display| {
        Error::KeyGen(format!("{context} {}: {e}", path.display()))
    };

    if let Some(dir) = path.parent() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(dir)
            .map_err(|e| keygen("failed to create directory for", &e))?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| keygen("failed to encode", &e))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| keygen("failed to create", &e))?;
    file.write_all(encoded.as_bytes())
        .map_err(|e| keygen("failed to write", &e))?;
    file.sync_all().map_err(|e| keygen("failed to sync", &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_key_is_cached_and_reused() {
        let cache = TempDir::new().unwrap();

        let first = get_host_key(None, Some(cache.path())).unwrap();
        let path = cached_key_path(cache.path());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let second = get_host_key(None, Some(cache.path())).unwrap();
        assert_eq!(
            first.public_key().fingerprint(HashAlg::Sha256),
            second.public_key().fingerprint(HashAlg::Sha256)
        );
    }

    #[test]
    fn test_configured_key_is_loaded() {
        let dir = TempDir::new().unwrap();
        let generated = get_host_key(None, Some(dir.path())).unwrap();

        let loaded = get_host_key(Some(&cached_key_path(dir.path())), None).unwrap();
        assert_eq!(
            generated.public_key().fingerprint(HashAlg::Sha256),
            loaded.public_key().fingerprint(HashAlg::Sha256)
        );
    }

    #[test]
    fn test_corrupt_key_is_key_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad_key");
        fs::write(&path, "not a key").unwrap();

        let err = get_host_key(Some(&path), None).unwrap_err();
        assert!(matches!(err, Error::KeyLoad { .. }));

        let missing = dir.path().join("missing");
        let err = get_host_key(Some(&missing), None).unwrap_err();
        assert!(matches!(err, Error::KeyLoad { .. }));
    }

    #[test]
    fn test_corrupt_cached_key_is_key_load_error() {
        let cache = TempDir::new().unwrap();
        let path = cached_key_path(cache.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "garbage").unwrap();

        assert!(matches!(
            get_host_key(None, Some(cache.path())),
            Err(Error::KeyLoad { .. })
        ));
    }

    #[test]
    fn test_unwritable_cache_is_key_gen_error() {
        let dir = TempDir::new().unwrap();
        // A regular file where the cache directory should be
        let blocker = dir.path().join("cache");
        fs::write(&blocker, "").unwrap();

        assert!(matches!(
            get_host_key(None, Some(&blocker)),
            Err(Error::KeyGen(_))
        ));
        assert!(matches!(get_host_key(None, None), Err(Error::KeyGen(_))));
    }
}
