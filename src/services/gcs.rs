use crate::config::{StorageConfig, StorageCredentials};
use crate::services::storage::{
    MULTIPART_CHUNK_SIZE, ObjectMetadata, Result, StorageError, StorageService, UploadResult,
    read_chunk,
};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, LOCATION};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Tokens this close to expiry are replaced before use.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Mints OAuth2 access tokens for a service account by exchanging a signed
/// JWT assertion at the token endpoint.
struct ServiceAccountTokens {
    client_email: String,
    key: EncodingKey,
    token_uri: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokens {
    fn new(client_email: &str, private_key: &str, token_uri: &str) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
            StorageError::NotConfigured(format!("STORAGE_PRIVATE_KEY is not an RSA key: {}", e))
        })?;
        Ok(Self {
            client_email: client_email.to_string(),
            key,
            token_uri: token_uri.to_string(),
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: STORAGE_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| StorageError::Backend(format!("Failed to sign token request: {}", e)))
    }

    async fn access_token(&self, http: &reqwest::Client) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.assertion()?;
        let response = http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(backend)?;
        let response = expect_success(response, "Token exchange").await?;
        let token: TokenResponse = response.json().await.map_err(backend)?;

        let lifetime = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64);
        tracing::debug!("Minted storage access token for {}", self.client_email);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(token.access_token)
    }
}

/// Google Cloud Storage through the JSON API, authenticated as a service
/// account. Objects are written with resumable uploads so a failed stream
/// can be cancelled without leaving a partial object behind.
pub struct GcsStorageService {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    tokens: ServiceAccountTokens,
}

impl GcsStorageService {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let StorageCredentials::ServiceAccount {
            client_email,
            private_key,
        } = &config.credentials
        else {
            return Err(StorageError::NotConfigured(
                "service account credentials are required for the JSON API".to_string(),
            ));
        };

        // Resumable uploads answer 308 for accepted chunks
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(backend)?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            bucket: config.bucket.clone(),
            tokens: ServiceAccountTokens::new(client_email, private_key, &config.token_uri)?,
        })
    }

    /// Reads the bucket resource to confirm the credentials can reach it.
    pub async fn check_bucket(&self) -> Result<()> {
        let token = self.tokens.access_token(&self.http).await?;
        let response = self
            .http
            .get(format!("{}/storage/v1/b/{}", self.endpoint, self.bucket))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(backend)?;
        expect_success(response, "Bucket lookup").await?;
        Ok(())
    }

    async fn start_session(
        &self,
        token: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        let user_metadata: serde_json::Map<String, serde_json::Value> = metadata
            .user_metadata()
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect();

        let response = self
            .http
            .post(format!(
                "{}/upload/storage/v1/b/{}/o",
                self.endpoint, self.bucket
            ))
            .query(&[("uploadType", "resumable")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", &metadata.content_type)
            .json(&serde_json::json!({
                "name": key,
                "contentType": metadata.content_type,
                "metadata": user_metadata,
            }))
            .send()
            .await
            .map_err(backend)?;
        let response = expect_success(response, "Upload session").await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend("Upload session has no location".to_string()))
    }

    /// Sends the body in fixed-size chunks. One chunk is read ahead so the
    /// last one can declare the total size, which is what commits the object.
    async fn send_chunks<'a>(
        &self,
        token: &str,
        session: &str,
        reader: &mut Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<u64> {
        let mut offset = 0u64;
        let mut chunk = read_chunk(reader, MULTIPART_CHUNK_SIZE).await?;

        loop {
            let next = if chunk.len() == MULTIPART_CHUNK_SIZE {
                read_chunk(reader, MULTIPART_CHUNK_SIZE).await?
            } else {
                Vec::new()
            };
            let last = next.is_empty();
            let len = chunk.len() as u64;
            let range = content_range(offset, len, last);

            let response = self
                .http
                .put(session)
                .bearer_auth(token)
                .header(CONTENT_RANGE, range)
                .body(chunk)
                .send()
                .await
                .map_err(backend)?;

            offset += len;
            if last {
                expect_success(response, "Final chunk").await?;
                return Ok(offset);
            }
            if response.status() != StatusCode::PERMANENT_REDIRECT {
                return Err(unexpected(response, "Chunk upload").await);
            }
            chunk = next;
        }
    }

    async fn cancel_session(&self, token: &str, session: &str) {
        match self.http.delete(session).bearer_auth(token).send().await {
            // 499 is the documented answer to a cancelled session
            Ok(response) if response.status().is_success() || response.status().as_u16() == 499 => {}
            Ok(response) => tracing::error!(
                "Failed to cancel upload session: {}",
                unexpected(response, "Cancel").await
            ),
            Err(e) => tracing::error!("Failed to cancel upload session: {}", e),
        }
    }
}

#[async_trait]
impl StorageService for GcsStorageService {
    async fn put_object<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        metadata: &ObjectMetadata,
    ) -> Result<UploadResult> {
        let token = self.tokens.access_token(&self.http).await?;
        let session = self.start_session(&token, key, metadata).await?;

        let size = match self.send_chunks(&token, &session, &mut reader).await {
            Ok(size) => size,
            Err(e) => {
                tracing::error!("Cancelling resumable upload for {}: {}", key, e);
                self.cancel_session(&token, &session).await;
                return Err(e);
            }
        };

        tracing::debug!("Stored gs://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(UploadResult {
            key: key.to_string(),
            size,
        })
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }
}

fn content_range(offset: u64, len: u64, last: bool) -> String {
    match (len, last) {
        (0, true) => format!("bytes */{}", offset),
        (_, true) => format!("bytes {}-{}/{}", offset, offset + len - 1, offset + len),
        _ => format!("bytes {}-{}/*", offset, offset + len - 1),
    }
}

fn backend(e: reqwest::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

async fn expect_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(unexpected(response, what).await)
    }
}

async fn unexpected(response: reqwest::Response, what: &str) -> StorageError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StorageError::Backend(format!("{} failed with {}: {}", what, status, body.trim()))
}
