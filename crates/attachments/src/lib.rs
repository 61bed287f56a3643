use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose};
use core_types::Attachment;
use mime_guess::MimeGuess;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name}: unsupported file type {mime_type}")]
    UnsupportedType { name: String, mime_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Text,
    Binary,
}

pub fn media_kind(mime_type: &str) -> Option<AttachmentKind> {
    match mime_type {
        "text/plain" | "text/csv" | "application/json" | "text/markdown" | "text/x-markdown" => {
            Some(AttachmentKind::Text)
        }
        "image/jpeg" | "image/png" | "image/webp" | "application/pdf" => {
            Some(AttachmentKind::Binary)
        }
        _ => None,
    }
}

fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    // mime_guess has no entry for markdown on every platform table
    if matches!(ext.as_deref(), Some("md" | "markdown")) {
        return "text/markdown".to_string();
    }
    MimeGuess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub fn classify(
    name: impl Into<String>,
    mime_type: &str,
    bytes: &[u8],
) -> Result<Attachment, AttachmentError> {
    let name = name.into();
    match media_kind(mime_type) {
        Some(AttachmentKind::Text) => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.strip_prefix('\u{feff}').unwrap_or(text.as_ref());
            Ok(Attachment::text(name, mime_type, text))
        }
        Some(AttachmentKind::Binary) => {
            let payload = general_purpose::STANDARD.encode(bytes);
            Ok(Attachment::binary(
                name,
                mime_type,
                format!("data:{mime_type};base64,{payload}"),
            ))
        }
        None => Err(AttachmentError::UnsupportedType {
            name,
            mime_type: mime_type.to_string(),
        }),
    }
}

pub async fn load_attachment(path: &Path) -> Result<Attachment, AttachmentError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mime_type = guess_mime(path);
    if media_kind(&mime_type).is_none() {
        return Err(AttachmentError::UnsupportedType { name, mime_type });
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| AttachmentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(file = %name, mime = %mime_type, size = bytes.len(), "attachment read");
    classify(name, &mime_type, &bytes)
}

#[derive(Debug, Default)]
pub struct PendingAttachment {
    path: Option<PathBuf>,
}

impl PendingAttachment {
    /// Replace any pending file, returning the one it displaced.
    pub fn set(&mut self, path: impl Into<PathBuf>) -> Option<PathBuf> {
        self.path.replace(path.into())
    }

    pub fn take(&mut self) -> Option<PathBuf> {
        self.path.take()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }
}

/// Read a pending file; an unreadable file degrades to no attachment.
pub async fn resolve(path: Option<PathBuf>) -> Option<Attachment> {
    let path = path?;
    match load_attachment(&path).await {
        Ok(attachment) => Some(attachment),
        Err(err) => {
            warn!(path = %path.display(), "dropping attachment: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn text_media_is_decoded() {
        let attachment = classify("notes.csv", "text/csv", b"\xef\xbb\xbfa,b\n1,2").expect("csv");
        assert!(!attachment.is_binary);
        assert_eq!(attachment.data, "a,b\n1,2");
        assert_eq!(attachment.mime_type, "text/csv");
    }

    #[test]
    fn binary_media_becomes_data_url() {
        let attachment = classify("dot.png", "image/png", &[0x89, 0x50, 0x4e, 0x47]).expect("png");
        assert!(attachment.is_binary);
        assert_eq!(attachment.data, "data:image/png;base64,iVBORw==");
        assert_eq!(attachment.base64_payload(), Some("iVBORw=="));
    }

    #[test]
    fn unknown_media_is_rejected() {
        let err = classify("song.mp3", "audio/mpeg", b"ID3").expect_err("unsupported");
        assert!(matches!(err, AttachmentError::UnsupportedType { .. }));
    }

    #[tokio::test]
    async fn loads_markdown_and_pdf_from_disk() {
        let dir = tempdir().expect("tempdir");
        let md = dir.path().join("README.md");
        std::fs::write(&md, "# Title").expect("write md");
        let pdf = dir.path().join("paper.PDF");
        std::fs::write(&pdf, b"%PDF-1.4").expect("write pdf");

        let text = load_attachment(&md).await.expect("md");
        assert_eq!(text.mime_type, "text/markdown");
        assert_eq!(text.name, "README.md");
        assert_eq!(text.data, "# Title");

        let binary = load_attachment(&pdf).await.expect("pdf");
        assert!(binary.is_binary);
        assert!(binary.data.starts_with("data:application/pdf;base64,"));
    }

    #[tokio::test]
    async fn unreadable_file_resolves_to_none() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("gone.txt");
        assert!(resolve(Some(missing)).await.is_none());
        assert!(resolve(None).await.is_none());
    }

    #[test]
    fn new_attachment_replaces_pending_one() {
        let mut pending = PendingAttachment::default();
        assert!(pending.set("a.txt").is_none());
        assert_eq!(pending.set("b.png"), Some(PathBuf::from("a.txt")));
        assert_eq!(pending.path(), Some(Path::new("b.png")));
        assert_eq!(pending.take(), Some(PathBuf::from("b.png")));
        assert!(pending.is_empty());
    }
}
