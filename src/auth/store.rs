// Credential store backing the admin CRUD API and the token pool.
//
// The on-disk form is a pretty-printed JSON array of credential records,
// written atomically (temp file + rename) with mode 0600. One RwLock guards
// both the in-memory list and the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::CredentialConfig;

/// Env var holding either a path to a credential file or an inline JSON
/// array (or single object) of credential records. Consulted when the
/// configured credential file is absent or unreadable.
pub const INLINE_CREDENTIALS_ENV: &str = "KIRO_AUTH_TOKEN";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("credential {0} not found")]
    NotFound(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid credential json: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct CredentialStore {
    file_path: PathBuf,
    inner: RwLock<Vec<CredentialConfig>>,
}

impl CredentialStore {
    /// Load the store. Sources, in priority order: the file at `file_path`,
    /// then the inline env var (path or JSON). An empty result is not an
    /// error here; callers decide whether zero usable credentials is fatal.
    pub fn load(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let configs = Self::load_sources(&file_path);
        info!(
            path = %file_path.display(),
            total = configs.len(),
            "credential store loaded"
        );
        Self {
            file_path,
            inner: RwLock::new(configs),
        }
    }

    fn load_sources(file_path: &Path) -> Vec<CredentialConfig> {
        match fs::read_to_string(file_path) {
            Ok(content) if content.trim().len() > 2 => {
                match parse_credentials(&content) {
                    Ok(configs) if !configs.is_empty() => return configs,
                    Ok(_) => {}
                    Err(e) => warn!("credential file is not valid JSON: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read credential file: {}", e),
        }

        let Ok(raw) = std::env::var(INLINE_CREDENTIALS_ENV) else {
            return Vec::new();
        };
        if raw.trim().is_empty() {
            return Vec::new();
        }

        // The env var may name a file or carry the JSON inline.
        let content = match fs::read_to_string(raw.trim()) {
            Ok(file_content) => {
                debug!("credentials loaded from file named by {}", INLINE_CREDENTIALS_ENV);
                file_content
            }
            Err(_) => raw,
        };

        match parse_credentials(&content) {
            Ok(configs) => configs,
            Err(e) => {
                warn!("{} does not contain valid credential JSON: {}", INLINE_CREDENTIALS_ENV, e);
                Vec::new()
            }
        }
    }

    /// Full list, including disabled and incomplete records.
    pub fn list(&self) -> Vec<CredentialConfig> {
        self.inner.read().unwrap().clone()
    }

    /// Records eligible to serve traffic: non-disabled, with a refresh token,
    /// and with client credentials when the auth type requires them.
    pub fn runtime_credentials(&self) -> Vec<CredentialConfig> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.is_runtime_usable())
            .cloned()
            .collect()
    }

    pub fn add(&self, config: CredentialConfig) -> Result<(), StoreError> {
        let mut list = self.inner.write().unwrap();
        list.push(config);
        self.save_locked(&list)
    }

    pub fn update(&self, index: usize, config: CredentialConfig) -> Result<(), StoreError> {
        let mut list = self.inner.write().unwrap();
        if index >= list.len() {
            return Err(StoreError::NotFound(index));
        }
        list[index] = config;
        self.save_locked(&list)
    }

    pub fn delete(&self, index: usize) -> Result<(), StoreError> {
        let mut list = self.inner.write().unwrap();
        if index >= list.len() {
            return Err(StoreError::NotFound(index));
        }
        list.remove(index);
        self.save_locked(&list)
    }

    /// Re-read the backing sources, replacing the in-memory list.
    pub fn reload(&self) {
        let configs = Self::load_sources(&self.file_path);
        *self.inner.write().unwrap() = configs;
    }

    /// Persist a rotated refresh token issued by the upstream, matching the
    /// record by its previous refresh token. A miss is not an error: the
    /// record may live only in the inline env source.
    pub fn rotate_refresh_token(&self, old_token: &str, new_token: &str) -> Result<(), StoreError> {
        let mut list = self.inner.write().unwrap();
        let Some(record) = list.iter_mut().find(|c| c.refresh_token == old_token) else {
            debug!("rotated refresh token has no stored record, skipping persist");
            return Ok(());
        };
        record.refresh_token = new_token.to_string();
        self.save_locked(&list)
    }

    fn save_locked(&self, list: &[CredentialConfig]) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(list)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }
}

/// Parse either a JSON array of records or a single record object.
fn parse_credentials(content: &str) -> Result<Vec<CredentialConfig>, serde_json::Error> {
    match serde_json::from_str::<Vec<CredentialConfig>>(content) {
        Ok(list) => Ok(list),
        Err(_) => serde_json::from_str::<CredentialConfig>(content).map(|single| vec![single]),
    }
}
