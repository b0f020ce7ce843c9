use crate::error::ProviderError;
use crate::traits::ImageStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Content-addressed object key: `{prefix}/{sha256}.{ext}`.
pub fn content_key(prefix: &str, bytes: &[u8], mime_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!(
        "{}/{:x}.{}",
        prefix.trim_matches('/'),
        hasher.finalize(),
        extension_for(mime_type)
    )
}

pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// Writes images under a directory that some web server exposes at `base_url`.
pub struct LocalDirImageStore {
    root: PathBuf,
    base_url: String,
}

impl LocalDirImageStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ProviderError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ProviderError::BackendResponse {
                backend: "image-store".to_string(),
                details: format!("invalid object key: {key}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalDirImageStore {
    async fn upload(
        &self,
        bytes: &[u8],
        key: &str,
        _mime_type: &str,
    ) -> Result<String, ProviderError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("{}/{}", self.base_url, key))
    }
}
