/// File-backed token persistence
///
/// One JSON document at a fixed path. Failures are logged and treated as
/// "no persisted state"; the in-memory token stays authoritative.
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::TokenRecord;
use crate::error::{AuthError, AuthResult};

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist the record. Never fails; errors are logged.
    async fn save(&self, record: &TokenRecord);

    /// Load the persisted record, `None` if missing or unreadable.
    async fn load(&self) -> Option<TokenRecord>;

    /// Remove the persisted record.
    async fn clear(&self);
}

pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no file exists, `Err` when it exists but is unusable
    pub async fn try_load(&self) -> AuthResult<Option<TokenRecord>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AuthError::storage(&self.path, e)),
        };

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| AuthError::storage(&self.path, e))
    }

    /// Write to a sibling temp file, then rename over the target
    pub async fn try_save(&self, record: &TokenRecord) -> AuthResult<()> {
        let json = serde_json::to_string_pretty(record).map_err(|e| AuthError::storage(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AuthError::storage(parent, e))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AuthError::storage(&tmp, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| AuthError::storage(&tmp, e))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AuthError::storage(&self.path, e))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, record: &TokenRecord) {
        match self.try_save(record).await {
            Ok(()) => debug!("Token saved to {}", self.path.display()),
            Err(e) => warn!("Failed to persist token: {}", e),
        }
    }

    async fn load(&self) -> Option<TokenRecord> {
        match self.try_load().await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                debug!("No stored token at {}", self.path.display());
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable token file: {}", e);
                None
            }
        }
    }

    async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed token file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove token file {}: {}", self.path.display(), e),
        }
    }
}
