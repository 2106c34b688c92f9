//! Source asset access.

use async_trait::async_trait;
use base64::Engine;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StoreError;

/// Read-only blob store addressed by asset key.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Assets laid out on disk as `<root>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    root: PathBuf,
}

impl LocalAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path below the root, rejecting absolute keys and
    /// parent-directory segments.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidAssetKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Lists image keys under `root/<prefix>`, sorted, using `/` separators.
    pub fn list_image_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let base = match prefix {
            Some(prefix) => self.path_for(prefix)?,
            None => self.root.clone(),
        };
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base).follow_links(true) {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::AssetUnavailable {
                key: key.to_string(),
                source,
            })
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// MIME type guessed from the key's extension, JPEG when unknown.
pub fn mime_for_key(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

/// Encodes image bytes as a base64 `data:` URI for multimodal chat content.
pub fn image_data_uri(key: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_for_key(key),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
