//! Session-scoped key/value store that carries identifiers from one
//! pipeline stage to the next.
//!
//! A record is written by one stage right before it transitions and is
//! consumed by the next. [`HandoffStore::take`] reads and deletes in one step;
//! [`HandoffStore::peek`] leaves the record in place so a failed stage can be
//! retried against the same data.

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffKey {
    TempFileDataUrl,
    UploadFileName,
    UploadFileType,
    LastUploadedTaskId,
    LastUploadedFileExtension,
    ProcessedArtifactUrl,
    ProcessedTaskId,
    ProcessedContentType,
}

impl HandoffKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffKey::TempFileDataUrl => "tempFileDataUrl",
            HandoffKey::UploadFileName => "uploadFileName",
            HandoffKey::UploadFileType => "uploadFileType",
            HandoffKey::LastUploadedTaskId => "lastUploadedTaskId",
            HandoffKey::LastUploadedFileExtension => "lastUploadedFileExtension",
            HandoffKey::ProcessedArtifactUrl => "processedArtifactUrl",
            HandoffKey::ProcessedTaskId => "processedTaskId",
            HandoffKey::ProcessedContentType => "processedContentType",
        }
    }
}

impl std::fmt::Display for HandoffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed group of keys written and read together.
pub trait HandoffRecord: Sized {
    const KEYS: &'static [HandoffKey];

    fn to_entries(&self) -> Vec<(HandoffKey, String)>;

    /// `values` follows the order of `KEYS`.
    fn from_values(values: Vec<String>) -> Self;
}

/// Written when the user confirms a file: the cached file representation
/// used to re-enter submission on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionHandoff {
    pub data_url: String,
    pub file_name: String,
    pub file_type: String,
}

impl HandoffRecord for SelectionHandoff {
    const KEYS: &'static [HandoffKey] = &[
        HandoffKey::TempFileDataUrl,
        HandoffKey::UploadFileName,
        HandoffKey::UploadFileType,
    ];

    fn to_entries(&self) -> Vec<(HandoffKey, String)> {
        vec![
            (HandoffKey::TempFileDataUrl, self.data_url.clone()),
            (HandoffKey::UploadFileName, self.file_name.clone()),
            (HandoffKey::UploadFileType, self.file_type.clone()),
        ]
    }

    fn from_values(values: Vec<String>) -> Self {
        let [data_url, file_name, file_type]: [String; 3] =
            values.try_into().unwrap_or_default();
        Self {
            data_url,
            file_name,
            file_type,
        }
    }
}

/// Written after the receiver accepted the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandoff {
    pub task_id: String,
    pub file_extension: String,
    pub original_file_name: String,
}

impl HandoffRecord for UploadHandoff {
    const KEYS: &'static [HandoffKey] = &[
        HandoffKey::LastUploadedTaskId,
        HandoffKey::LastUploadedFileExtension,
        HandoffKey::UploadFileName,
    ];

    fn to_entries(&self) -> Vec<(HandoffKey, String)> {
        vec![
            (HandoffKey::LastUploadedTaskId, self.task_id.clone()),
            (
                HandoffKey::LastUploadedFileExtension,
                self.file_extension.clone(),
            ),
            (HandoffKey::UploadFileName, self.original_file_name.clone()),
        ]
    }

    fn from_values(values: Vec<String>) -> Self {
        let [task_id, file_extension, original_file_name]: [String; 3] =
            values.try_into().unwrap_or_default();
        Self {
            task_id,
            file_extension,
            original_file_name,
        }
    }
}

/// Written after the processor produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHandoff {
    pub artifact_url: String,
    pub task_id: String,
    pub content_type: String,
}

impl HandoffRecord for ResultHandoff {
    const KEYS: &'static [HandoffKey] = &[
        HandoffKey::ProcessedArtifactUrl,
        HandoffKey::ProcessedTaskId,
        HandoffKey::ProcessedContentType,
    ];

    fn to_entries(&self) -> Vec<(HandoffKey, String)> {
        vec![
            (HandoffKey::ProcessedArtifactUrl, self.artifact_url.clone()),
            (HandoffKey::ProcessedTaskId, self.task_id.clone()),
            (HandoffKey::ProcessedContentType, self.content_type.clone()),
        ]
    }

    fn from_values(values: Vec<String>) -> Self {
        let [artifact_url, task_id, content_type]: [String; 3] =
            values.try_into().unwrap_or_default();
        Self {
            artifact_url,
            task_id,
            content_type,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandoffStore {
    entries: Arc<DashMap<HandoffKey, String>>,
}

impl HandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: HandoffKey, value: impl Into<String>) {
        self.entries.insert(key, value.into());
    }

    pub fn get(&self, key: HandoffKey) -> Option<String> {
        self.entries.get(&key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: HandoffKey) -> Option<String> {
        self.entries.remove(&key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: HandoffKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn put<R: HandoffRecord>(&self, record: &R) {
        for (key, value) in record.to_entries() {
            self.entries.insert(key, value);
        }
    }

    /// Returns the record if every key is present. Empty strings count as
    /// present.
    pub fn peek<R: HandoffRecord>(&self) -> Option<R> {
        let values = R::KEYS
            .iter()
            .map(|key| self.get(*key))
            .collect::<Option<Vec<_>>>()?;
        Some(R::from_values(values))
    }

    /// Like [`peek`](Self::peek) but deletes the record's keys once read. An
    /// incomplete record is left untouched.
    pub fn take<R: HandoffRecord>(&self) -> Option<R> {
        let record = self.peek::<R>()?;
        self.discard::<R>();
        Some(record)
    }

    /// Keys the record needs that are currently absent.
    pub fn missing<R: HandoffRecord>(&self) -> Vec<HandoffKey> {
        R::KEYS
            .iter()
            .copied()
            .filter(|key| !self.contains(*key))
            .collect()
    }

    pub fn discard<R: HandoffRecord>(&self) {
        for key in R::KEYS {
            self.entries.remove(key);
        }
    }
}
