use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::utils::naming::DEFAULT_UPLOAD_FOLDER;

/// Google Cloud Storage API root, serving both the JSON and the XML API.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing storage configuration: {}", .0.join(", "))]
    MissingVars(Vec<&'static str>),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Upload receiver settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 3000)
    pub port: u16,

    /// Maximum request body in bytes (default: 100 MB)
    pub max_file_size: usize,

    /// Folder prefix for stored uploads (default: "uploads")
    pub upload_folder: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_file_size: 100 * 1024 * 1024, // 100 MB
            upload_folder: DEFAULT_UPLOAD_FOLDER.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.port),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            upload_folder: env::var("UPLOAD_FOLDER")
                .ok()
                .map(|v| v.trim().trim_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default.upload_folder),
        }
    }
}

/// How the receiver authenticates to the bucket.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageCredentials {
    /// Service account key. Requests carry an OAuth2 access token minted from
    /// a signed JWT and go through the JSON API.
    ServiceAccount {
        client_email: String,
        private_key: String,
    },
    /// HMAC key pair for the S3-compatible XML API.
    Hmac { access_id: String, secret: String },
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageCredentials::ServiceAccount {
                client_email,
                private_key,
            } => f
                .debug_struct("ServiceAccount")
                .field("client_email", client_email)
                .field("private_key", &format!("<{} bytes>", private_key.len()))
                .finish(),
            StorageCredentials::Hmac { access_id, .. } => f
                .debug_struct("Hmac")
                .field("access_id", access_id)
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Object storage settings. Bucket and project are always required. The
/// service-account email and key are required unless an HMAC pair is given.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub project_id: String,
    pub credentials: StorageCredentials,
    pub endpoint: String,
    /// OAuth2 token endpoint for service-account credentials
    pub token_uri: String,
    /// Signing region for HMAC credentials
    pub region: String,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Empty values
    /// count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let mut require = |name: &'static str| {
            let value = get(name);
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };

        let bucket = require("STORAGE_BUCKET");
        let project_id = require("STORAGE_PROJECT_ID");

        let credentials = match (get("STORAGE_HMAC_ACCESS_ID"), get("STORAGE_HMAC_SECRET")) {
            (Some(access_id), Some(secret)) => StorageCredentials::Hmac { access_id, secret },
            _ => {
                let client_email = require("STORAGE_CLIENT_EMAIL");
                let private_key = require("STORAGE_PRIVATE_KEY");
                StorageCredentials::ServiceAccount {
                    client_email,
                    // Keys pasted into .env files usually carry escaped newlines
                    private_key: private_key.replace("\\n", "\n"),
                }
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing));
        }

        let endpoint = get("STORAGE_ENDPOINT").unwrap_or_else(|| DEFAULT_STORAGE_ENDPOINT.into());
        let token_uri = get("STORAGE_TOKEN_URI").unwrap_or_else(|| DEFAULT_TOKEN_URI.into());
        for (name, value) in [("STORAGE_ENDPOINT", &endpoint), ("STORAGE_TOKEN_URI", &token_uri)] {
            url::Url::parse(value).map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            bucket,
            project_id,
            credentials,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token_uri,
            region: get("STORAGE_REGION").unwrap_or_else(|| "auto".to_string()),
        })
    }
}

/// How the waiting stage talks to the external processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProcessorMode {
    /// One POST that answers with the artifact body.
    Direct,
    /// Submit, poll a status endpoint, then fetch the result.
    Polling,
}

/// Client-side pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base URL of the upload receiver
    pub receiver_url: String,

    pub processor_mode: ProcessorMode,

    /// Direct mode: the processing endpoint. Polling mode: optional submit endpoint.
    pub processor_url: Option<String>,

    /// Polling mode: status is fetched from `<status_url>/<task_id>`
    pub status_url: Option<String>,

    /// Polling mode: result is fetched from `<result_url>/<task_id>`
    pub result_url: Option<String>,

    /// Fixed polling cadence (default: 2 s)
    pub poll_interval: Duration,

    /// Wait before calling the processor so the stored object is visible
    pub settle_delay: Duration,

    /// glTF viewer used to build preview links for model artifacts
    pub viewer_base_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            receiver_url: "http://localhost:3000".to_string(),
            processor_mode: ProcessorMode::Direct,
            processor_url: None,
            status_url: None,
            result_url: None,
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::ZERO,
            viewer_base_url: "https://gltf-viewer.donmccurdy.com/".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            receiver_url: env::var("RECEIVER_URL").unwrap_or(default.receiver_url),

            processor_mode: match env::var("PROCESSOR_MODE").as_deref() {
                Ok("polling") | Ok("poll") => ProcessorMode::Polling,
                Ok("direct") => ProcessorMode::Direct,
                _ => default.processor_mode,
            },

            processor_url: env::var("PROCESSOR_URL").ok().or(default.processor_url),
            status_url: env::var("PROCESSOR_STATUS_URL").ok().or(default.status_url),
            result_url: env::var("PROCESSOR_RESULT_URL").ok().or(default.result_url),

            poll_interval: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.poll_interval),

            settle_delay: env::var("SETTLE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.settle_delay),

            viewer_base_url: env::var("VIEWER_BASE_URL").unwrap_or(default.viewer_base_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.upload_folder, "uploads");
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.processor_mode, ProcessorMode::Direct);
    }

    #[test]
    fn test_storage_config_service_account() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BUCKET", "photos"),
            ("STORAGE_PROJECT_ID", "model-generate"),
            ("STORAGE_CLIENT_EMAIL", "svc@example.iam"),
            ("STORAGE_PRIVATE_KEY", "line1\\nline2"),
        ]))
        .unwrap();
        assert_eq!(config.bucket, "photos");
        assert_eq!(
            config.credentials,
            StorageCredentials::ServiceAccount {
                client_email: "svc@example.iam".to_string(),
                private_key: "line1\nline2".to_string(),
            }
        );
        assert_eq!(config.endpoint, DEFAULT_STORAGE_ENDPOINT);
        assert_eq!(config.token_uri, DEFAULT_TOKEN_URI);
        assert!(!format!("{:?}", config).contains("line1"));
    }

    #[test]
    fn test_storage_config_hmac_replaces_service_account() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BUCKET", "photos"),
            ("STORAGE_PROJECT_ID", "model-generate"),
            ("STORAGE_HMAC_ACCESS_ID", "GOOG1EXAMPLE"),
            ("STORAGE_HMAC_SECRET", "bGFzdCBzZWNyZXQ"),
            ("STORAGE_ENDPOINT", "http://127.0.0.1:9000/"),
        ]))
        .unwrap();
        assert!(matches!(
            &config.credentials,
            StorageCredentials::Hmac { access_id, .. } if access_id == "GOOG1EXAMPLE"
        ));
        assert_eq!(config.endpoint, "http://127.0.0.1:9000");
        assert!(!format!("{:?}", config).contains("bGFzdCBzZWNyZXQ"));
    }

    #[test]
    fn test_storage_config_reports_every_missing_var() {
        let err = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BUCKET", "photos"),
            ("STORAGE_CLIENT_EMAIL", "  "),
            ("STORAGE_HMAC_ACCESS_ID", "GOOG1EXAMPLE"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingVars(vec![
                "STORAGE_PROJECT_ID",
                "STORAGE_CLIENT_EMAIL",
                "STORAGE_PRIVATE_KEY"
            ])
        );
        assert!(err.to_string().contains("STORAGE_PRIVATE_KEY"));
    }

    #[test]
    fn test_storage_config_rejects_bad_endpoint() {
        let err = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BUCKET", "photos"),
            ("STORAGE_PROJECT_ID", "p"),
            ("STORAGE_CLIENT_EMAIL", "e"),
            ("STORAGE_PRIVATE_KEY", "k"),
            ("STORAGE_ENDPOINT", "not a url"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "STORAGE_ENDPOINT", .. }));
    }
}
