use bytes::Bytes;
use dashmap::DashMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::Arc;
use uuid::Uuid;

pub const BLOB_URL_PREFIX: &str = "blob:";

pub const GLB_MIME: &str = "model/gltf-binary";
pub const GLTF_MIME: &str = "model/gltf+json";

/// Characters left alone by a URI component encoder.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// What the processor handed back: either the bytes themselves or where to
/// find them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPayload {
    Bytes {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Remote {
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: String,
}

/// In-session registry of downloaded artifacts addressed by `blob:` URLs.
/// Entries live until revoked.
#[derive(Debug, Clone, Default)]
pub struct BlobRegistry {
    blobs: Arc<DashMap<String, Blob>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, bytes: Bytes, content_type: impl Into<String>) -> String {
        let url = format!("{}{}", BLOB_URL_PREFIX, Uuid::new_v4());
        self.blobs.insert(
            url.clone(),
            Blob {
                bytes,
                content_type: content_type.into(),
            },
        );
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Blob> {
        self.blobs.get(url).map(|b| b.value().clone())
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

pub fn is_blob_url(location: &str) -> bool {
    location.starts_with(BLOB_URL_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Model,
    Image,
    Other,
}

impl ArtifactKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == GLB_MIME || essence == GLTF_MIME {
            ArtifactKind::Model
        } else if essence.starts_with("image/") {
            ArtifactKind::Image
        } else {
            ArtifactKind::Other
        }
    }

    /// Guesses from a URL path's extension.
    pub fn from_location(location: &str) -> Self {
        let path = location.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        match crate::utils::naming::file_extension(file)
            .to_ascii_lowercase()
            .as_str()
        {
            "glb" | "gltf" => ArtifactKind::Model,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => ArtifactKind::Image,
            _ => ArtifactKind::Other,
        }
    }
}

/// Sniffs a content type from artifact bytes, recognising binary glTF which
/// the stock matchers do not know.
pub fn sniff_content_type(bytes: &[u8]) -> Option<String> {
    let mut matcher = infer::Infer::new();
    matcher.add(GLB_MIME, "glb", |buf| buf.starts_with(b"glTF"));
    matcher.get(bytes).map(|t| t.mime_type().to_string())
}

/// Everything the result stage needs to show the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultView {
    pub task_id: String,
    pub location: String,
    pub content_type: String,
    pub kind: ArtifactKind,
    pub download_name: String,
    pub viewer_url: Option<String>,
}

impl ResultView {
    pub fn new(task_id: &str, location: &str, content_type: &str, viewer_base_url: &str) -> Self {
        let mut kind = ArtifactKind::from_content_type(content_type);
        if kind == ArtifactKind::Other && !is_blob_url(location) {
            kind = ArtifactKind::from_location(location);
        }

        let download_name = match kind {
            ArtifactKind::Model => format!("model-{}.glb", task_id),
            ArtifactKind::Image => format!(
                "image-{}.{}",
                task_id,
                image_extension(content_type).unwrap_or("png")
            ),
            ArtifactKind::Other => format!("result-{}", task_id),
        };

        // A blob: URL only means something inside this session
        let viewer_url = (kind == ArtifactKind::Model && !is_blob_url(location))
            .then(|| viewer_link(viewer_base_url, location));

        Self {
            task_id: task_id.to_string(),
            location: location.to_string(),
            content_type: content_type.to_string(),
            kind,
            download_name,
            viewer_url,
        }
    }
}

pub fn viewer_link(viewer_base_url: &str, model_url: &str) -> String {
    format!(
        "{}#model={}",
        viewer_base_url,
        utf8_percent_encode(model_url, URI_COMPONENT)
    )
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    match content_type.split(';').next()?.trim() {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_registry_lifecycle() {
        let registry = BlobRegistry::new();
        let url = registry.create(Bytes::from_static(b"glTF...."), GLB_MIME);
        assert!(is_blob_url(&url));
        assert_eq!(registry.resolve(&url).unwrap().content_type, GLB_MIME);
        assert!(registry.revoke(&url));
        assert!(registry.resolve(&url).is_none());
        assert!(!registry.revoke(&url));
    }

    #[test]
    fn test_sniff_glb_and_png() {
        assert_eq!(sniff_content_type(b"glTF\x02\0\0\0").as_deref(), Some(GLB_MIME));
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(sniff_content_type(&png).as_deref(), Some("image/png"));
        assert_eq!(sniff_content_type(b"plain"), None);
    }

    #[test]
    fn test_model_view_has_viewer_link() {
        let view = ResultView::new(
            "abc123",
            "https://storage.example.com/out/abc123.glb?x=1&y=2",
            "",
            "https://gltf-viewer.donmccurdy.com/",
        );
        assert_eq!(view.kind, ArtifactKind::Model);
        assert_eq!(view.download_name, "model-abc123.glb");
        assert_eq!(
            view.viewer_url.as_deref(),
            Some(
                "https://gltf-viewer.donmccurdy.com/#model=https%3A%2F%2Fstorage.example.com%2Fout%2Fabc123.glb%3Fx%3D1%26y%3D2"
            )
        );
    }

    #[test]
    fn test_blob_image_view() {
        let view = ResultView::new("abc123", "blob:1234", "image/jpeg", "https://viewer/");
        assert_eq!(view.kind, ArtifactKind::Image);
        assert_eq!(view.download_name, "image-abc123.jpg");
        assert!(view.viewer_url.is_none());
    }
}
