//! Tunnel config retrieval from disk

use async_trait::async_trait;
use std::path::PathBuf;
use veil_session::{ConfigProvider, FetchError};

/// Reads the tunnel config from a file on every connect
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn fetch_config_text(&self) -> Result<String, FetchError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError(format!("{}: {}", self.path.display(), e)))
    }
}
