use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Parts smaller than this go up in a single PUT.
pub const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage is not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to read upload body: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage write failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata attached to every stored upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub original_file_name: String,
    pub file_extension: String,
    pub task_id: String,
    /// RFC 3339 time the task was created
    pub uploaded_at: String,
}

impl ObjectMetadata {
    /// User metadata pairs as sent to the backend. The file name is
    /// percent-encoded because header values must stay ASCII.
    pub fn user_metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "originalFileName",
                utf8_percent_encode(&self.original_file_name, NON_ALPHANUMERIC).to_string(),
            ),
            ("fileExtension", self.file_extension.clone()),
            ("taskId", self.task_id.clone()),
            ("uploadedAt", self.uploaded_at.clone()),
        ]
    }
}

#[derive(Debug)]
pub struct UploadResult {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Streams `reader` to `key`. Either the whole object is committed or
    /// nothing is.
    async fn put_object<'a>(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        metadata: &ObjectMetadata,
    ) -> Result<UploadResult>;

    fn bucket(&self) -> Option<&str>;
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn put_single(&self, key: &str, data: Vec<u8>, metadata: &ObjectMetadata) -> Result<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&metadata.content_type)
            .body(ByteStream::from(data));
        for (k, v) in metadata.user_metadata() {
            req = req.metadata(k, v);
        }

        req.send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn put_multipart<'a>(
        &self,
        key: &str,
        first_chunk: Vec<u8>,
        reader: &mut Box<dyn AsyncRead + Unpin + Send + 'a>,
        metadata: &ObjectMetadata,
    ) -> Result<u64> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&metadata.content_type);
        for (k, v) in metadata.user_metadata() {
            req = req.metadata(k, v);
        }

        let created = req
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Backend("No upload ID".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first_chunk, reader).await {
            Ok(size) => Ok(size),
            Err(e) => {
                tracing::error!("Aborting multipart upload {} for {}: {}", upload_id, key, e);
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::error!(
                        "Failed to abort multipart upload {}: {}",
                        upload_id,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<'a>(
        &self,
        key: &str,
        upload_id: &str,
        first_chunk: Vec<u8>,
        reader: &mut Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<u64> {
        let mut part_number = 1;
        let mut completed_parts = Vec::new();
        let mut total_size = 0u64;
        let mut chunk = first_chunk;

        loop {
            if chunk.is_empty() {
                break;
            }
            total_size += chunk.len() as u64;

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(chunk))
                .part_number(part_number)
                .send()
                .await
                .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            chunk = read_chunk(reader, MULTIPART_CHUNK_SIZE).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(total_size)
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn put_object<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        metadata: &ObjectMetadata,
    ) -> Result<UploadResult> {
        let first = read_chunk(&mut reader, MULTIPART_CHUNK_SIZE).await?;

        let size = if first.len() < MULTIPART_CHUNK_SIZE {
            let size = first.len() as u64;
            self.put_single(key, first, metadata).await?;
            size
        } else {
            self.put_multipart(key, first, &mut reader, metadata).await?
        };

        tracing::debug!("Stored s3://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(UploadResult {
            key: key.to_string(),
            size,
        })
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }
}

/// Stand-in used when storage credentials are missing at startup. Every write
/// fails with the recorded reason so the server keeps answering requests.
pub struct UnconfiguredStorage {
    reason: String,
}

impl UnconfiguredStorage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StorageService for UnconfiguredStorage {
    async fn put_object<'a>(
        &self,
        _key: &str,
        _reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        _metadata: &ObjectMetadata,
    ) -> Result<UploadResult> {
        Err(StorageError::NotConfigured(self.reason.clone()))
    }

    fn bucket(&self) -> Option<&str> {
        None
    }
}

/// Fills up to `limit` bytes, returning fewer only at end of stream.
pub(crate) async fn read_chunk<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; limit];
    let mut n = 0;
    while n < limit {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    buffer.truncate(n);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_metadata_encodes_file_name() {
        let metadata = ObjectMetadata {
            content_type: "image/png".to_string(),
            original_file_name: "写真 1.png".to_string(),
            file_extension: "png".to_string(),
            task_id: "abc123".to_string(),
            uploaded_at: "2026-10-17T09:30:00+00:00".to_string(),
        };
        let pairs = metadata.user_metadata();
        assert_eq!(pairs[0].0, "originalFileName");
        assert!(pairs[0].1.is_ascii());
        assert!(pairs[0].1.ends_with("%2Epng"));
        assert_eq!(pairs[2], ("taskId", "abc123".to_string()));
        assert_eq!(
            pairs[3],
            ("uploadedAt", "2026-10-17T09:30:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_chunk_stops_at_eof() {
        let data = vec![7u8; 10];
        let mut reader: &[u8] = &data;
        let chunk = read_chunk(&mut reader, 4).await.unwrap();
        assert_eq!(chunk.len(), 4);
        let chunk = read_chunk(&mut reader, 16).await.unwrap();
        assert_eq!(chunk.len(), 6);
        let chunk = read_chunk(&mut reader, 16).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_storage_rejects_writes() {
        let storage = UnconfiguredStorage::new("STORAGE_BUCKET");
        let metadata = ObjectMetadata {
            content_type: "image/png".to_string(),
            original_file_name: "photo.png".to_string(),
            file_extension: "png".to_string(),
            task_id: "abc123".to_string(),
            uploaded_at: "2026-10-17T09:30:00+00:00".to_string(),
        };
        let err = storage
            .put_object("uploads/abc123.png", Box::new(&b"data"[..]), &metadata)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::NotConfigured(_)));
        assert!(storage.bucket().is_none());
    }
}
