//! Persistent node identity.
//!
//! The secret key lives in `<home>/<alias>.private-key` as 64 lowercase hex
//! characters. A missing file means "first run": a key is generated and saved.

use std::path::{Path, PathBuf};

use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("could not access key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("key file {path} does not contain a 32 byte hex encoded key")]
    InvalidKey { path: PathBuf },
}

pub fn key_path(home: &Path, alias: &str) -> PathBuf {
    home.join(format!("{alias}.private-key"))
}

/// Reads an existing secret key or creates a new one if none exists.
///
/// # Errors
///
/// Returns an error if the home directory or the key file cannot be accessed,
/// or if an existing key file is corrupt. A corrupt key is never silently
/// replaced, since that would change this node's ID52.
#[tracing::instrument]
pub async fn load_or_create_key(
    home: &Path,
    alias: &str,
) -> Result<iroh::SecretKey, IdentityError> {
    let path = key_path(home, alias);

    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let key = parse_key(contents.trim()).ok_or_else(|| IdentityError::InvalidKey {
                path: path.clone(),
            })?;
            tracing::info!("Loaded existing key from {}", path.display());
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No existing key found, generating new one");
            let key = generate_key();

            tokio::fs::create_dir_all(home)
                .await
                .map_err(|source| IdentityError::Io {
                    path: home.to_path_buf(),
                    source,
                })?;
            tokio::fs::write(&path, data_encoding::HEXLOWER.encode(&key.to_bytes()))
                .await
                .map_err(|source| IdentityError::Io {
                    path: path.clone(),
                    source,
                })?;

            tracing::info!("Generated and saved new key to {}", path.display());
            Ok(key)
        }
        Err(source) => Err(IdentityError::Io { path, source }),
    }
}

pub fn generate_key() -> iroh::SecretKey {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    iroh::SecretKey::from_bytes(&bytes)
}

fn parse_key(hex: &str) -> Option<iroh::SecretKey> {
    let bytes: [u8; 32] = data_encoding::HEXLOWER_PERMISSIVE
        .decode(hex.as_bytes())
        .ok()?
        .try_into()
        .ok()?;
    Some(iroh::SecretKey::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_is_created_then_reloaded() {
        let home = tempfile::tempdir().unwrap();

        let first = load_or_create_key(home.path(), "tunnel").await.unwrap();
        assert!(key_path(home.path(), "tunnel").exists());

        let second = load_or_create_key(home.path(), "tunnel").await.unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[tokio::test]
    async fn test_corrupt_key_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(key_path(home.path(), "tunnel"), "not a key").unwrap();

        let result = load_or_create_key(home.path(), "tunnel").await;
        assert!(matches!(result, Err(IdentityError::InvalidKey { .. })));
    }
}
