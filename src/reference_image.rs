use std::io;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use tokio::fs;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum ReferenceImageError {
    #[error("reference image not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read reference image {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn mime_type_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Reads the fixed reference image and returns it as a data URI.
#[derive(Debug)]
pub struct ReferenceImageLoader {
    path: PathBuf,
    cached: Option<OnceCell<String>>,
}

impl ReferenceImageLoader {
    /// Re-reads the file on every call, so a deleted file is noticed immediately.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    /// Encodes the file once and serves the cached string afterwards.
    pub fn cached(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Some(OnceCell::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub async fn load(&self) -> Result<String, ReferenceImageError> {
        match &self.cached {
            Some(cell) => cell.get_or_try_init(|| self.read_encoded()).await.cloned(),
            None => self.read_encoded().await,
        }
    }

    async fn read_encoded(&self) -> Result<String, ReferenceImageError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ReferenceImageError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(ReferenceImageError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        Ok(encode_data_uri(mime_type_from_path(&self.path), &bytes))
    }
}
