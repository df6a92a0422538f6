//! Persistent global state and secret storage

pub mod global_state;
pub mod secrets;

pub use global_state::{
    GlobalStateStore, JsonFileGlobalState, MemoryGlobalState, SqliteGlobalState,
};
pub use secrets::{
    EncryptedFileSecretStorage, InMemorySecretStorage, KeychainSecretStorage, SecretStorage,
};

use crate::capabilities::GlobalStateMode;
use crate::config::{GlobalStateBackend, SecretBackend, StorageConfig};
use crate::error::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the global state store for a session
///
/// Stateless clients always get a fresh in-memory store.
pub fn open_global_state(
    config: &StorageConfig,
    mode: GlobalStateMode,
) -> Result<Arc<dyn GlobalStateStore>> {
    match mode {
        GlobalStateMode::Stateless => return Ok(Arc::new(MemoryGlobalState::new())),
        GlobalStateMode::ClientManaged => {
            warn!("Client-managed global state is not supported, keeping it in memory");
            return Ok(Arc::new(MemoryGlobalState::new()));
        }
        GlobalStateMode::ServerManaged => {}
    }
    let store: Arc<dyn GlobalStateStore> = match &config.global_state {
        GlobalStateBackend::Memory => Arc::new(MemoryGlobalState::new()),
        GlobalStateBackend::File { path } => Arc::new(JsonFileGlobalState::open(path)?),
        GlobalStateBackend::Sqlite { path } => {
            Arc::new(SqliteGlobalState::open(path, &config.ide_identifier)?)
        }
    };
    info!("Global state backend: {:?}", config.global_state);
    Ok(store)
}

pub fn open_secret_storage(config: &StorageConfig) -> Result<Arc<dyn SecretStorage>> {
    let storage: Arc<dyn SecretStorage> = match &config.secrets {
        SecretBackend::Memory => Arc::new(InMemorySecretStorage::new()),
        SecretBackend::EncryptedFile {
            path,
            passphrase_env,
        } => Arc::new(EncryptedFileSecretStorage::from_env(path, passphrase_env)?),
        SecretBackend::Keychain { service } => Arc::new(KeychainSecretStorage::new(service.clone())),
    };
    Ok(storage)
}
