use crate::config::{ConfigError, StorageConfig, StorageCredentials};
use crate::services::gcs::GcsStorageService;
use crate::services::storage::{
    S3StorageService, StorageError, StorageService, UnconfiguredStorage,
};
use aws_sdk_s3::config::{Credentials, Region};
use std::sync::Arc;
use tracing::{error, info};

/// Builds the storage client. A configuration fault does not stop the
/// server: it is logged loudly and every upload fails with the reason.
pub async fn setup_storage(config: Result<StorageConfig, ConfigError>) -> Arc<dyn StorageService> {
    let reason = match config {
        Ok(config) => match connect(config).await {
            Ok(storage) => return storage,
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };
    error!("❌ CRITICAL: {}. Uploads will be rejected until this is fixed.", reason);
    Arc::new(UnconfiguredStorage::new(reason))
}

/// Picks the backend matching the credentials: service accounts use the
/// JSON API, HMAC keys use the S3-compatible XML API.
pub async fn connect(config: StorageConfig) -> Result<Arc<dyn StorageService>, StorageError> {
    info!(
        "☁️  Object Storage: {} (Bucket: {}, Project: {})",
        config.endpoint, config.bucket, config.project_id
    );

    match &config.credentials {
        StorageCredentials::ServiceAccount { client_email, .. } => {
            info!("🔑 Authenticating as service account {}", client_email);
            let storage = GcsStorageService::from_config(&config)?;
            match storage.check_bucket().await {
                Ok(()) => info!("✅ Bucket '{}' is reachable", config.bucket),
                Err(e) => error!("⚠️  Bucket '{}' is not reachable yet: {}", config.bucket, e),
            }
            Ok(Arc::new(storage))
        }
        StorageCredentials::Hmac { access_id, secret } => {
            info!("🔑 Authenticating with HMAC key {}", access_id);
            let client = s3_client(&config, access_id, secret).await;
            match client.head_bucket().bucket(&config.bucket).send().await {
                Ok(_) => info!("✅ Bucket '{}' is reachable", config.bucket),
                Err(e) => error!(
                    "⚠️  Bucket '{}' is not reachable yet: {}",
                    config.bucket,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ),
            }
            Ok(Arc::new(S3StorageService::new(client, config.bucket)))
        }
    }
}

async fn s3_client(config: &StorageConfig, access_id: &str, secret: &str) -> aws_sdk_s3::Client {
    let aws_config = aws_config::from_env()
        .endpoint_url(&config.endpoint)
        .region(Region::new(config.region.clone()))
        .credentials_provider(Credentials::new(access_id, secret, None, None, "static"))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}
