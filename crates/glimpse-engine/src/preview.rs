use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::selection::ImageSource;

/// A renderable reference to the selected image.
///
/// Not `Clone`: the only way to invalidate a handle is [`PreviewStore::revoke`],
/// which takes it by value, so a revoked handle cannot be read again.
#[derive(Debug, PartialEq, Eq)]
pub struct PreviewHandle {
    id: u64,
    url: String,
    media_type: String,
    dimensions: Option<(u32, u32)>,
}

impl PreviewHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `data:` URL for in-memory images, `file://` URL for picked files.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Pixel size, when the payload decodes as an image.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }
}

/// Issues preview handles and keeps count of every creation and revocation.
#[derive(Debug, Default)]
pub struct PreviewStore {
    next_id: u64,
    live: BTreeSet<u64>,
    created: u64,
    revoked: u64,
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, source: &ImageSource, media_type: &str) -> PreviewHandle {
        self.next_id += 1;
        let id = self.next_id;
        let (url, dimensions) = match source {
            ImageSource::Bytes(bytes) => (
                format!("data:{media_type};base64,{}", BASE64.encode(bytes)),
                bytes_dimensions(bytes),
            ),
            ImageSource::File(path) => (file_url(path), image::image_dimensions(path).ok()),
        };
        self.live.insert(id);
        self.created += 1;
        tracing::debug!(preview_id = id, media_type, "preview created");
        PreviewHandle {
            id,
            url,
            media_type: media_type.to_string(),
            dimensions,
        }
    }

    pub fn revoke(&mut self, handle: PreviewHandle) {
        if !self.live.remove(&handle.id) {
            tracing::warn!(preview_id = handle.id, "revoked a preview this store does not own");
            return;
        }
        self.revoked += 1;
        tracing::debug!(preview_id = handle.id, "preview revoked");
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn revoked(&self) -> u64 {
        self.revoked
    }
}

fn bytes_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn file_url(path: &Path) -> String {
    let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    reqwest::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| format!("file://{}", absolute.display()))
}
