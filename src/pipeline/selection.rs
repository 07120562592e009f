use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use std::path::Path;

use super::error::PipelineError;
use super::handoff::SelectionHandoff;

/// A file the user picked, held in memory until it is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Reads a file from disk, sniffing its MIME type from the content.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| crate::utils::naming::UNNAMED_FILE.to_string());
        let content_type = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

        Ok(Self::new(name, content_type, bytes))
    }

    /// `data:<mime>;base64,<payload>`
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            STANDARD.encode(&self.bytes)
        )
    }

    pub fn to_handoff(&self) -> SelectionHandoff {
        SelectionHandoff {
            data_url: self.to_data_url(),
            file_name: self.name.clone(),
            file_type: self.content_type.clone(),
        }
    }

    /// Rebuilds the file from its cached representation. The stored
    /// `file_type` wins over the MIME type embedded in the data URL.
    pub fn from_handoff(record: &SelectionHandoff) -> Result<Self, PipelineError> {
        let (mime_from_url, bytes) = decode_data_url(&record.data_url)?;
        let content_type = if record.file_type.is_empty() {
            mime_from_url
        } else {
            record.file_type.clone()
        };
        Ok(Self::new(record.file_name.clone(), content_type, bytes))
    }
}

fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), PipelineError> {
    let invalid = || PipelineError::Validation("The cached file data is unreadable.".to_string());

    let rest = data_url.strip_prefix("data:").ok_or_else(invalid)?;
    let (header, payload) = rest.split_once(',').ok_or_else(invalid)?;
    let mime_type = header.split(';').next().unwrap_or_default().to_string();

    let bytes = if header.ends_with(";base64") {
        STANDARD.decode(payload).map_err(|_| invalid())?
    } else {
        percent_encoding::percent_decode_str(payload).collect()
    };

    Ok((mime_type, bytes))
}
