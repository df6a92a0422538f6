//! Secret storage backends

use crate::error::{AgentError, Result};
use crate::sync::lock;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const NONCE_SIZE: usize = 12;

#[async_trait]
pub trait SecretStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn store(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySecretStorage {
    secrets: Mutex<HashMap<String, String>>,
}

impl InMemorySecretStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStorage for InMemorySecretStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.secrets).get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.secrets).insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        lock(&self.secrets).remove(key);
        Ok(())
    }
}

/// AES-256-GCM encrypted JSON file
///
/// The key is the SHA-256 digest of a passphrase. Each value is stored as
/// base64 of `nonce || ciphertext` with a fresh nonce per write.
pub struct EncryptedFileSecretStorage {
    path: PathBuf,
    cipher: Aes256Gcm,
    file_lock: tokio::sync::Mutex<()>,
}

impl EncryptedFileSecretStorage {
    pub fn new(path: impl AsRef<Path>, passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            path: path.as_ref().to_path_buf(),
            cipher: Aes256Gcm::new(key),
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read the passphrase from an environment variable
    pub fn from_env(path: impl AsRef<Path>, variable: &str) -> Result<Self> {
        let passphrase = std::env::var(variable).map_err(|_| {
            AgentError::Config(format!(
                "Secret storage passphrase variable {variable} is not set"
            ))
        })?;
        if passphrase.is_empty() {
            return Err(AgentError::Config(format!(
                "Secret storage passphrase variable {variable} is empty"
            )));
        }
        Ok(Self::new(path, &passphrase))
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AgentError::Storage(format!("Secret encryption failed: {e}")))?;
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let payload = STANDARD
            .decode(encoded)
            .map_err(|e| AgentError::Storage(format!("Secret is not valid base64: {e}")))?;
        if payload.len() < NONCE_SIZE {
            return Err(AgentError::Storage("Secret payload is truncated".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AgentError::Storage(format!("Secret decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| AgentError::Storage(format!("Secret is not UTF-8: {e}")))
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                AgentError::Storage(format!("Corrupt secret file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, secrets: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, serde_json::to_vec_pretty(secrets)?).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStorage for EncryptedFileSecretStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.file_lock.lock().await;
        match self.load().await?.get(key) {
            Some(encoded) => self.decrypt(encoded).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        let mut secrets = self.load().await?;
        secrets.insert(key.to_string(), self.encrypt(value)?);
        self.save(&secrets).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        let mut secrets = self.load().await?;
        if secrets.remove(key).is_some() {
            self.save(&secrets).await?;
        }
        Ok(())
    }
}

/// OS credential manager through its command-line tool
///
/// macOS uses `security`, Linux uses `secret-tool` from libsecret. Other
/// platforms report the backend as unsupported.
#[derive(Debug, Clone)]
pub struct KeychainSecretStorage {
    service: String,
}

enum Platform {
    MacOs,
    Linux,
    Unsupported,
}

fn platform() -> Platform {
    if cfg!(target_os = "macos") {
        Platform::MacOs
    } else if cfg!(target_os = "linux") {
        Platform::Linux
    } else {
        Platform::Unsupported
    }
}

struct Output {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl KeychainSecretStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn unsupported() -> AgentError {
        AgentError::Storage(format!(
            "Keychain secret storage is not supported on {}",
            std::env::consts::OS
        ))
    }

    async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        debug!("Running {} {}", program, args.first().copied().unwrap_or_default());
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Storage(format!("Failed to run {program}: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(Output {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl SecretStorage for KeychainSecretStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let output = match platform() {
            Platform::MacOs => {
                Self::run(
                    "security",
                    &["find-generic-password", "-s", self.service.as_str(), "-a", key, "-w"],
                    None,
                )
                .await?
            }
            Platform::Linux => {
                Self::run(
                    "secret-tool",
                    &["lookup", "service", self.service.as_str(), "account", key],
                    None,
                )
                .await?
            }
            Platform::Unsupported => return Err(Self::unsupported()),
        };

        if output.success {
            return Ok(Some(output.stdout.trim_end_matches('\n').to_string()));
        }
        // `security` exits 44 for a missing item; `secret-tool` exits 1 with no output
        match output.code {
            Some(44) | Some(1) => Ok(None),
            _ => Err(AgentError::Storage(format!(
                "Keychain lookup failed: {}",
                output.stderr
            ))),
        }
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        let label = format!("{} {}", self.service, key);
        let output = match platform() {
            Platform::MacOs => {
                Self::run(
                    "security",
                    &["add-generic-password", "-U", "-s", self.service.as_str(), "-a", key, "-w", value],
                    None,
                )
                .await?
            }
            Platform::Linux => {
                Self::run(
                    "secret-tool",
                    &["store", "--label", label.as_str(), "service", self.service.as_str(), "account", key],
                    Some(value),
                )
                .await?
            }
            Platform::Unsupported => return Err(Self::unsupported()),
        };
        if output.success {
            Ok(())
        } else {
            Err(AgentError::Storage(format!(
                "Keychain store failed: {}",
                output.stderr
            )))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let output = match platform() {
            Platform::MacOs => {
                Self::run(
                    "security",
                    &["delete-generic-password", "-s", self.service.as_str(), "-a", key],
                    None,
                )
                .await?
            }
            Platform::Linux => {
                Self::run(
                    "secret-tool",
                    &["clear", "service", self.service.as_str(), "account", key],
                    None,
                )
                .await?
            }
            Platform::Unsupported => return Err(Self::unsupported()),
        };
        if !output.success {
            warn!("Keychain delete for {} reported: {}", key, output.stderr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let storage = InMemorySecretStorage::new();
        storage.store("token", "abc").await.unwrap();
        assert_eq!(storage.get("token").await.unwrap().as_deref(), Some("abc"));
        storage.delete("token").await.unwrap();
        assert_eq!(storage.get("token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_encrypted_file_hides_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let storage = EncryptedFileSecretStorage::new(&path, "passphrase");

        storage.store("token", "super-secret-value").await.unwrap();
        storage.store("other", "second").await.unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("super-secret-value"));
        assert!(on_disk.contains("token"));

        let reopened = EncryptedFileSecretStorage::new(&path, "passphrase");
        assert_eq!(
            reopened.get("token").await.unwrap().as_deref(),
            Some("super-secret-value")
        );

        reopened.delete("token").await.unwrap();
        assert_eq!(reopened.get("token").await.unwrap(), None);
        assert_eq!(reopened.get("other").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        EncryptedFileSecretStorage::new(&path, "right")
            .store("token", "value")
            .await
            .unwrap();

        let wrong = EncryptedFileSecretStorage::new(&path, "wrong");
        assert!(matches!(
            wrong.get("token").await,
            Err(AgentError::Storage(_))
        ));
    }

    #[test]
    fn test_missing_passphrase_variable() {
        let result = EncryptedFileSecretStorage::from_env(
            "/tmp/unused-secrets.json",
            "IDE_AGENT_TEST_PASSPHRASE_THAT_IS_NOT_SET",
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
