use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::guess_image_mime;
use crate::preview::{PreviewHandle, PreviewStore};

/// Where the selected image's bytes live. File-backed sources are read when
/// an analysis is submitted, not when they are picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl ImageSource {
    /// Base64 (standard alphabet) of the image bytes.
    pub fn encode_base64(&self) -> Result<String> {
        match self {
            Self::Bytes(bytes) => Ok(BASE64.encode(bytes)),
            Self::File(path) => {
                let bytes = fs::read(path)
                    .with_context(|| format!("failed reading {}", path.display()))?;
                Ok(BASE64.encode(bytes))
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            Self::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ImageSelection {
    source: ImageSource,
    media_type: String,
    preview: PreviewHandle,
}

impl ImageSelection {
    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn preview(&self) -> &PreviewHandle {
        &self.preview
    }

    /// Detached copy for an in-flight request. Later selection changes do not
    /// touch it.
    pub fn snapshot(&self) -> ImageSnapshot {
        ImageSnapshot {
            source: self.source.clone(),
            media_type: self.media_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSnapshot {
    pub source: ImageSource,
    pub media_type: String,
}

/// Owns the current selection and the only live preview handle.
#[derive(Debug, Default)]
pub struct SelectionHolder {
    previews: PreviewStore,
    current: Option<ImageSelection>,
}

impl SelectionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, bytes: impl Into<Arc<[u8]>>, media_type: &str) -> &ImageSelection {
        self.replace(ImageSource::Bytes(bytes.into()), media_type.trim().to_string())
    }

    pub fn select_path(&mut self, path: impl AsRef<Path>) -> Result<&ImageSelection> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("image not found: {}", path.display());
        }
        let media_type = guess_image_mime(path).to_string();
        Ok(self.replace(ImageSource::File(path.to_path_buf()), media_type))
    }

    /// Clears the selection. Returns `false` when there was nothing to clear.
    pub fn remove(&mut self) -> bool {
        let Some(previous) = self.current.take() else {
            return false;
        };
        self.previews.revoke(previous.preview);
        true
    }

    pub fn current(&self) -> Option<&ImageSelection> {
        self.current.as_ref()
    }

    pub fn snapshot(&self) -> Option<ImageSnapshot> {
        self.current.as_ref().map(ImageSelection::snapshot)
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    fn replace(&mut self, source: ImageSource, media_type: String) -> &ImageSelection {
        let preview = self.previews.create(&source, &media_type);
        if let Some(previous) = self.current.take() {
            self.previews.revoke(previous.preview);
        }
        self.current.insert(ImageSelection {
            source,
            media_type,
            preview,
        })
    }
}
