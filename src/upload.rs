use std::fmt;
use std::path::Path;

use image::ImageFormat;

use crate::config::{ACCEPTED_IMAGE_TYPES, MAX_FILE_SIZE_BYTES};
use crate::errors::{Result, SonoSegError};

/// A file handed over by the upload surface: raw bytes plus the MIME type it was declared with.
#[derive(Clone)]
pub struct Upload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Reads a file from disk, deriving the MIME type from its extension.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SonoSegError::Decode {
                operation: format!("reading {}", path.display()),
                source: Box::new(e),
            })?;
        let mime_type = ImageFormat::from_path(path)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self::new(name, mime_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRejection {
    UnsupportedType { mime_type: String, accepted: Vec<String> },
    TooLarge { size: u64, max_bytes: u64 },
    /// The analysis model is not loaded, so nothing could process the file.
    ModelNotReady,
}

impl fmt::Display for UploadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType { accepted, .. } => write!(
                f,
                "Invalid file type. Please upload an image ({}).",
                accepted.join(", ")
            ),
            Self::TooLarge { max_bytes, .. } => write!(
                f,
                "File is too large. Maximum size is {}MB.",
                max_bytes / (1024 * 1024)
            ),
            Self::ModelNotReady => f.write_str(
                "The analysis model is not loaded. Reset the tool to retry loading it.",
            ),
        }
    }
}

/// Accepted MIME types and maximum byte size, checked before any decoding work.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    accepted_types: Vec<String>,
    max_bytes: u64,
}

impl UploadPolicy {
    pub fn new(accepted_types: Vec<String>, max_bytes: u64) -> Self {
        Self {
            accepted_types,
            max_bytes,
        }
    }

    pub fn accepted_types(&self) -> &[String] {
        &self.accepted_types
    }

    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn accepts_type(&self, mime_type: &str) -> bool {
        self.accepted_types.iter().any(|t| t == mime_type)
    }

    pub fn check(&self, upload: &Upload) -> std::result::Result<(), UploadRejection> {
        if !self.accepts_type(&upload.mime_type) {
            return Err(UploadRejection::UnsupportedType {
                mime_type: upload.mime_type.clone(),
                accepted: self.accepted_types.clone(),
            });
        }
        if upload.size() > self.max_bytes {
            return Err(UploadRejection::TooLarge {
                size: upload.size(),
                max_bytes: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Short labels for the upload hint, e.g. `JPEG, PNG`.
    pub fn supported_label(&self) -> String {
        self.accepted_types
            .iter()
            .map(|t| t.rsplit('/').next().unwrap_or(t).to_uppercase())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(
            ACCEPTED_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            MAX_FILE_SIZE_BYTES,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_supported_types() {
        let policy = UploadPolicy::default();
        for mime in ACCEPTED_IMAGE_TYPES {
            let upload = Upload::new("scan", mime, vec![0; 16]);
            assert_eq!(policy.check(&upload), Ok(()));
        }
    }

    #[test]
    fn test_rejects_unsupported_type() {
        let policy = UploadPolicy::default();
        let upload = Upload::new("scan.dcm", "application/dicom", vec![0; 16]);
        let rejection = policy.check(&upload).unwrap_err();
        assert!(matches!(rejection, UploadRejection::UnsupportedType { .. }));
        assert!(rejection.to_string().starts_with("Invalid file type"));
    }

    #[test]
    fn test_size_limit_is_inclusive() {
        let policy = UploadPolicy::new(vec!["image/png".to_string()], 8);
        assert!(policy.check(&Upload::new("a.png", "image/png", vec![0; 8])).is_ok());

        let rejection = policy
            .check(&Upload::new("b.png", "image/png", vec![0; 9]))
            .unwrap_err();
        assert_eq!(
            rejection,
            UploadRejection::TooLarge {
                size: 9,
                max_bytes: 8
            }
        );
    }

    #[test]
    fn test_default_policy_message() {
        let policy = UploadPolicy::default();
        let upload = Upload::new("big.png", "image/png", vec![0; MAX_FILE_SIZE_BYTES as usize + 1]);
        assert_eq!(
            policy.check(&upload).unwrap_err().to_string(),
            "File is too large. Maximum size is 10MB."
        );
        assert_eq!(policy.supported_label(), "JPEG, PNG, WEBP, GIF");
    }
}
