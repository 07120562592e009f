use crate::models::Task;
use crate::services::storage::{ObjectMetadata, StorageError, StorageService};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Accepts one photo per call, assigns it a fresh task id and writes it to
/// `<folder>/<task_id>[.<ext>]` in object storage.
pub struct UploadService {
    storage: Arc<dyn StorageService>,
    folder: String,
}

impl UploadService {
    pub fn new(storage: Arc<dyn StorageService>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    pub async fn accept<'a>(
        &self,
        original_file_name: &str,
        content_type: Option<&str>,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<Task, StorageError> {
        let task = Task::new(original_file_name);
        let key = task.storage_key(&self.folder);

        tracing::debug!(
            task_id = %task.id,
            original_file_name = %task.original_file_name,
            file_extension = %task.file_extension,
            "Uploading to {}",
            key
        );

        let metadata = ObjectMetadata {
            content_type: content_type
                .filter(|c| !c.is_empty())
                .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
                .to_string(),
            original_file_name: task.original_file_name.clone(),
            file_extension: task.file_extension.clone(),
            task_id: task.id.clone(),
            uploaded_at: task.created_at.to_rfc3339(),
        };

        let stored = self.storage.put_object(&key, reader, &metadata).await?;

        tracing::info!(
            "📦 Stored {} ({} bytes) for task {} created {}",
            stored.key,
            stored.size,
            task.id,
            metadata.uploaded_at
        );
        Ok(task)
    }
}
