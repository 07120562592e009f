use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::utils::naming;

/// A single accepted upload. The id correlates the stored photo with the
/// artifact the external processor produces for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub file_extension: String,
    pub original_file_name: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(original_file_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_extension: naming::file_extension(original_file_name).to_string(),
            original_file_name: original_file_name.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn storage_key(&self, folder: &str) -> String {
        naming::storage_key(folder, &self.id, &self.file_extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub task_id: String,
    pub file_extension: String,
}

impl From<&Task> for UploadResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            file_extension: task.file_extension.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body sent to the external processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub task_id: String,
    pub file_extension: String,
}

/// Body returned by a processor status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// JSON result body naming a remote artifact instead of carrying its bytes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteArtifact {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl RemoteArtifact {
    pub fn location(&self) -> Option<&str> {
        [&self.url, &self.model_url, &self.image_url]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|s| !s.is_empty())
    }
}
