//! Inline image attachments for tool responses

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One base64-encoded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub mime_type: String,
    pub data: String,
}

/// MIME type by file extension, `None` for unsupported formats
pub fn detect_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Read and encode every usable attachment, skipping the rest
pub async fn encode_images(paths: &[String]) -> Vec<ImageContent> {
    let mut images = Vec::with_capacity(paths.len());

    for raw in paths {
        let path = Path::new(raw);
        let Some(mime_type) = detect_mime_type(path) else {
            tracing::warn!(path = %raw, "Skipping attachment with unsupported image type");
            continue;
        };

        match tokio::fs::read(path).await {
            Ok(bytes) => images.push(ImageContent {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(bytes),
            }),
            Err(e) => {
                tracing::warn!(path = %raw, error = %e, "Skipping unreadable attachment");
            }
        }
    }

    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_mime_type() {
        assert_eq!(detect_mime_type(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(detect_mime_type(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(detect_mime_type(Path::new("a.jpg")), Some("image/jpeg"));
        assert_eq!(detect_mime_type(Path::new("a.webp")), Some("image/webp"));
        assert_eq!(detect_mime_type(Path::new("a.bmp")), None);
        assert_eq!(detect_mime_type(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn test_encode_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("shot.png");
        std::fs::write(&png, b"\x89PNG").unwrap();
        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, b"hello").unwrap();

        let paths = vec![
            png.display().to_string(),
            txt.display().to_string(),
            dir.path().join("missing.gif").display().to_string(),
        ];
        let images = encode_images(&paths).await;

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].data, STANDARD.encode(b"\x89PNG"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let image = ImageContent {
            mime_type: "image/gif".into(),
            data: "R0lG".into(),
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["mimeType"], "image/gif");
    }
}
