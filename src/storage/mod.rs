use crate::config::StorageConfig;
use crate::error::Error;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use url::Url;

/// Durable storage for uploaded video files
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the bytes under `filename` and return a URL the detector can fetch
    async fn store(&self, bytes: &[u8], filename: &str) -> Result<String>;

    /// Remove a previously stored object. Used to roll back a failed ingestion.
    async fn remove(&self, url: &str) -> Result<()>;
}

/// Blob store writing into a local directory
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: Option<Url>,
}

impl LocalBlobStore {
    /// Create the storage directory if needed and resolve its absolute path
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage_path)
            .await
            .with_context(|| format!("Failed to create storage dir {:?}", config.storage_path))?;
        let root = tokio::fs::canonicalize(&config.storage_path).await?;

        let public_base_url = match &config.public_base_url {
            Some(base) => {
                // Url::join drops the last segment unless the base ends with '/'
                let base = if base.ends_with('/') {
                    base.clone()
                } else {
                    format!("{}/", base)
                };
                Some(
                    Url::parse(&base)
                        .map_err(|e| Error::Config(format!("Invalid public_base_url: {}", e)))?,
                )
            }
            None => None,
        };

        info!("Blob store rooted at {}", root.display());
        Ok(Self {
            root,
            public_base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(&self, object_name: &str, path: &Path) -> Result<String> {
        let url = match &self.public_base_url {
            Some(base) => base
                .join(object_name)
                .map_err(|e| Error::Storage(format!("Failed to build object URL: {}", e)))?,
            None => Url::from_file_path(path)
                .map_err(|_| Error::Storage(format!("Not an absolute path: {:?}", path)))?,
        };
        Ok(url.to_string())
    }

    fn object_name_from_url(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| Error::Storage(format!("Invalid URL: {}", e)))?;
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .ok_or_else(|| Error::Storage(format!("URL has no object name: {}", url)).into())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, bytes: &[u8], filename: &str) -> Result<String> {
        let object_name = sanitize_filename(filename);
        let path = self.root.join(&object_name);

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {:?}: {}", path, e)))?;

        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        self.url_for(&object_name, &path)
    }

    async fn remove(&self, url: &str) -> Result<()> {
        let object_name = self.object_name_from_url(url)?;
        let path = self.root.join(sanitize_filename(&object_name));

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob already gone: {}", path.display());
                Ok(())
            }
            Err(e) => Err(Error::Storage(format!("Failed to remove {:?}: {}", path, e)).into()),
        }
    }
}

/// Reduce a client-supplied filename to a single safe path component
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, base: Option<&str>) -> StorageConfig {
        StorageConfig {
            storage_path: dir.to_path_buf(),
            public_base_url: base.map(str::to_string),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn filenames_cannot_escape_the_root() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\drone\\run 1.mp4"), "run_1.mp4");
        assert_eq!(sanitize_filename("..."), "upload");
    }

    #[tokio::test]
    async fn store_then_remove_with_file_urls() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalBlobStore::new(&config(dir.path(), None)).await?;

        let url = store.store(b"frames", "north field.mp4").await?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("north_field.mp4"));
        assert_eq!(
            tokio::fs::read(store.root().join("north_field.mp4")).await?,
            b"frames"
        );

        store.remove(&url).await?;
        assert!(!store.root().join("north_field.mp4").exists());
        // Removing twice is harmless
        store.remove(&url).await?;
        Ok(())
    }

    #[tokio::test]
    async fn public_base_url_is_used_when_configured() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store =
            LocalBlobStore::new(&config(dir.path(), Some("https://media.example/videos"))).await?;

        let url = store.store(b"x", "clip.mp4").await?;
        assert_eq!(url, "https://media.example/videos/clip.mp4");
        Ok(())
    }
}
