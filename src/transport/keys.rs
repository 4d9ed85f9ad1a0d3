use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::io::AsyncWriteExt;

use crate::error::{FleetError, Result};

/// Generate an Ed25519 keypair, write the private half to `path` (mode 0600)
/// and the public half to `path.pub`.
///
/// Returns the public key as an authorized_keys line. Refuses to overwrite an
/// existing private key.
pub async fn generate_keypair(path: &Path, comment: &str) -> Result<String> {
    if tokio::fs::try_exists(path).await? {
        return Err(FleetError::Config(format!(
            "refusing to overwrite existing key {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .await?;
    }

    let signing = ed25519_dalek::SigningKey::from_bytes(&rand::random::<[u8; 32]>());
    let public = PublicKey::Ed25519(signing.verifying_key());
    let pair = KeyPair::Ed25519(signing);

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&pair, &mut pem).map_err(|e| FleetError::KeyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(&pem).await?;
    file.flush().await?;

    let line = authorized_key_line(&public, Some(comment));
    tokio::fs::write(public_key_path(path), format!("{}\n", line)).await?;

    tracing::info!(path = %path.display(), "Generated SSH keypair");
    Ok(line)
}

pub fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Load a private key for public key authentication.
pub async fn load_signer(path: &Path) -> Result<Arc<KeyPair>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FleetError::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let key = russh_keys::decode_secret_key(&text, None).map_err(|e| FleetError::KeyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Arc::new(key))
}

pub fn authorized_key_line(key: &PublicKey, comment: Option<&str>) -> String {
    match comment {
        Some(c) if !c.is_empty() => format!("{} {} {}", key.name(), key.public_key_base64(), c),
        _ => format!("{} {}", key.name(), key.public_key_base64()),
    }
}

/// Split an authorized_keys line into `(key_type, base64)`, checking the key decodes.
pub fn parse_authorized_key(line: &str) -> Result<(String, String)> {
    let mut fields = line.split_whitespace();
    let (Some(key_type), Some(encoded)) = (fields.next(), fields.next()) else {
        return Err(FleetError::Decode(format!(
            "not an authorized key line: {:?}",
            line
        )));
    };
    let key = russh_keys::parse_public_key_base64(encoded)
        .map_err(|e| FleetError::Decode(format!("invalid public key: {}", e)))?;
    if key.name() != key_type {
        return Err(FleetError::Decode(format!(
            "key type {} does not match encoded {}",
            key_type,
            key.name()
        )));
    }
    Ok((key_type.to_string(), encoded.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn generated_key_is_private_and_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("id_ed25519");

        let line = generate_keypair(&path, "fleet").await.unwrap();
        assert!(line.starts_with("ssh-ed25519 "));
        assert!(line.ends_with(" fleet"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let signer = load_signer(&path).await.unwrap();
        let public = signer.clone_public_key().unwrap();
        assert_eq!(authorized_key_line(&public, Some("fleet")), line);

        let on_disk = std::fs::read_to_string(public_key_path(&path)).unwrap();
        assert_eq!(on_disk.trim(), line);
    }

    #[tokio::test]
    async fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        generate_keypair(&path, "").await.unwrap();
        assert!(matches!(
            generate_keypair(&path, "").await,
            Err(FleetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn parse_round_trips_generated_line() {
        let dir = tempfile::tempdir().unwrap();
        let line = generate_keypair(&dir.path().join("k"), "c").await.unwrap();
        let (key_type, encoded) = parse_authorized_key(&line).unwrap();
        assert_eq!(key_type, "ssh-ed25519");
        assert!(line.contains(&encoded));

        assert!(parse_authorized_key("ssh-ed25519").is_err());
        assert!(parse_authorized_key("ssh-ed25519 not-base64!").is_err());
    }

    #[tokio::test]
    async fn missing_key_is_a_load_error() {
        let result = load_signer(Path::new("/nonexistent/id_ed25519")).await;
        assert!(matches!(result, Err(FleetError::KeyLoad { .. })));
    }
}
