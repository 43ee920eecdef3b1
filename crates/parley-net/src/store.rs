//! Directory-backed file store

use async_trait::async_trait;
use parley_core::resource::{FileStore, ResourceError};
use parley_core::ResourceBuffer;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stores received resources under a root directory.
///
/// Files are content addressed (`<blake3 prefix>-<name>`), so receiving the
/// same file twice reuses the existing copy. Reads are confined to the root
/// and any directories added with [`DirStore::with_share_dir`].
pub struct DirStore {
    root: PathBuf,
    shared: Vec<PathBuf>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shared: Vec::new(),
        }
    }

    /// Allow files under `dir` to be sent as resources
    pub fn with_share_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shared.push(dir.into());
        self
    }

    fn local_path(path: &str) -> PathBuf {
        PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
    }

    /// Resolve `path` and check it lies under a readable directory
    async fn readable_path(&self, path: &str) -> Result<PathBuf, ResourceError> {
        let read_error = |reason: String| ResourceError::Read {
            path: path.to_string(),
            reason,
        };

        let local = tokio::fs::canonicalize(Self::local_path(path))
            .await
            .map_err(|e| read_error(e.to_string()))?;

        for dir in std::iter::once(&self.root).chain(&self.shared) {
            // a directory that does not exist yet holds nothing to read
            let Ok(dir) = tokio::fs::canonicalize(dir).await else {
                continue;
            };
            if local.starts_with(&dir) {
                return Ok(local);
            }
        }

        warn!("Refusing to read {} outside shared directories", local.display());
        Err(read_error("outside the store and shared directories".into()))
    }
}

/// Guess a MIME type from the file extension
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "resource".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl FileStore for DirStore {
    async fn read_buffer(&self, path: &str) -> Result<ResourceBuffer, ResourceError> {
        let local = self.readable_path(path).await?;
        let bytes = tokio::fs::read(&local)
            .await
            .map_err(|e| ResourceError::Read {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resource".to_string());
        let mime = guess_mime_type(&local);

        Ok(ResourceBuffer::new(bytes, name, mime))
    }

    async fn upload_buffer(&self, buffer: &ResourceBuffer) -> Result<String, ResourceError> {
        if buffer.size != buffer.bytes.len() as u64 {
            return Err(ResourceError::Upload {
                name: buffer.name.clone(),
                reason: format!(
                    "size mismatch: declared {}, got {}",
                    buffer.size,
                    buffer.bytes.len()
                ),
            });
        }

        tokio::fs::create_dir_all(&self.root).await?;

        let digest = blake3::hash(&buffer.bytes).to_hex();
        let file_name = format!("{}-{}", &digest.as_str()[..16], sanitize_name(&buffer.name));
        let target = self.root.join(file_name);

        if tokio::fs::try_exists(&target).await? {
            debug!("Reusing stored resource {}", target.display());
        } else {
            tokio::fs::write(&target, &buffer.bytes).await?;
        }

        let absolute = tokio::fs::canonicalize(&target).await?;
        Ok(absolute.to_string_lossy().into_owned())
    }
}
