use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use modelgen_relay::config::ServerConfig;
use modelgen_relay::services::storage::{
    ObjectMetadata, Result as StorageResult, StorageError, StorageService, UnconfiguredStorage,
    UploadResult,
};
use modelgen_relay::services::upload_service::UploadService;
use modelgen_relay::{AppState, create_app};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tower::ServiceExt;
use tracing::Level;

const BOUNDARY: &str = "---------------------------123456789012345678901234567";

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    metadata: ObjectMetadata,
}

#[derive(Default)]
struct MockStorageService {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MockStorageService {
    fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn put_object<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        metadata: &ObjectMetadata,
    ) -> StorageResult<UploadResult> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let size = bytes.len() as u64;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes,
                metadata: metadata.clone(),
            },
        );
        Ok(UploadResult {
            key: key.to_string(),
            size,
        })
    }

    fn bucket(&self) -> Option<&str> {
        Some("test-bucket")
    }
}

struct FailingStorageService;

#[async_trait]
impl StorageService for FailingStorageService {
    async fn put_object<'a>(
        &self,
        _key: &str,
        _reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        _metadata: &ObjectMetadata,
    ) -> StorageResult<UploadResult> {
        Err(StorageError::Backend("bucket quota exceeded".to_string()))
    }

    fn bucket(&self) -> Option<&str> {
        Some("test-bucket")
    }
}

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn app_with(storage: Arc<dyn StorageService>, config: ServerConfig) -> Router {
    let upload_service = Arc::new(UploadService::new(storage, config.upload_folder.clone()));
    create_app(AppState {
        upload_service,
        config,
    })
}

fn multipart_body(field: &str, file_name: &str, content_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\n\
        Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
        Content-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_upload_stores_object_under_task_id() {
    let storage = Arc::new(MockStorageService::default());
    let app = app_with(storage.clone(), ServerConfig::default());

    let content = b"\x89PNG\r\n\x1a\nnot really a png";
    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "photo.png",
            "image/png",
            content,
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    let json = json_body(response).await;
    let task_id = json["task_id"].as_str().unwrap();
    assert_eq!(task_id.len(), 36);
    assert_eq!(json["file_extension"], "png");

    let stored = storage
        .object(&format!("uploads/{}.png", task_id))
        .expect("object stored under uploads/<task_id>.png");
    assert_eq!(stored.bytes, content);
    assert_eq!(stored.metadata.content_type, "image/png");
    assert_eq!(stored.metadata.original_file_name, "photo.png");
    assert_eq!(stored.metadata.file_extension, "png");
    assert_eq!(stored.metadata.task_id, task_id);
}

#[tokio::test]
async fn test_upload_uses_configured_folder() {
    let storage = Arc::new(MockStorageService::default());
    let config = ServerConfig {
        upload_folder: "incoming/".to_string(),
        ..ServerConfig::default()
    };
    let app = app_with(storage.clone(), config);

    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "photo.jpg",
            "image/jpeg",
            b"jpeg bytes",
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let key = format!("incoming/{}.jpg", json["task_id"].as_str().unwrap());
    assert!(storage.object(&key).is_some());
}

#[tokio::test]
async fn test_upload_without_extension_has_no_dot() {
    let storage = Arc::new(MockStorageService::default());
    let app = app_with(storage.clone(), ServerConfig::default());

    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "README",
            "text/plain",
            b"hello",
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["file_extension"], "");

    let key = format!("uploads/{}", json["task_id"].as_str().unwrap());
    assert!(storage.object(&key).is_some());
}

#[tokio::test]
async fn test_upload_takes_extension_after_last_dot() {
    let storage = Arc::new(MockStorageService::default());
    let app = app_with(storage.clone(), ServerConfig::default());

    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "a.b.glb",
            "model/gltf-binary",
            b"glTF",
        )))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["file_extension"], "glb");

    let key = format!("uploads/{}.glb", json["task_id"].as_str().unwrap());
    let stored = storage.object(&key).unwrap();
    assert_eq!(stored.metadata.original_file_name, "a.b.glb");
}

#[tokio::test]
async fn test_upload_without_file_field_is_rejected() {
    let storage = Arc::new(MockStorageService::default());
    let app = app_with(storage.clone(), ServerConfig::default());

    let response = app
        .oneshot(upload_request(multipart_body(
            "attachment",
            "photo.png",
            "image/png",
            b"bytes",
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["message"], "No file uploaded.");
    assert_eq!(storage.len(), 0);
}

#[tokio::test]
async fn test_storage_failure_returns_500_with_detail() {
    let app = app_with(Arc::new(FailingStorageService), ServerConfig::default());

    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "photo.png",
            "image/png",
            b"bytes",
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["message"], "Internal Server Error (API Route)");
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("bucket quota exceeded")
    );
}

#[tokio::test]
async fn test_unconfigured_storage_returns_503() {
    let storage = Arc::new(UnconfiguredStorage::new(
        "Missing STORAGE_BUCKET, STORAGE_PRIVATE_KEY",
    ));
    let app = app_with(storage, ServerConfig::default());

    let response = app
        .clone()
        .oneshot(upload_request(multipart_body(
            "file",
            "photo.png",
            "image/png",
            b"bytes",
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["message"], "Storage is not configured");
    assert!(json["error"].as_str().unwrap().contains("STORAGE_BUCKET"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["storage"], "unconfigured");
}

#[tokio::test]
async fn test_oversized_upload_returns_413() {
    let storage = Arc::new(MockStorageService::default());
    let config = ServerConfig {
        max_file_size: 1024,
        ..ServerConfig::default()
    };
    let app = app_with(storage.clone(), config);

    let response = app
        .oneshot(upload_request(multipart_body(
            "file",
            "big.png",
            "image/png",
            &vec![7u8; 64 * 1024],
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(storage.len(), 0);
}

#[tokio::test]
async fn test_preflight_allows_any_origin() {
    let app = app_with(
        Arc::new(MockStorageService::default()),
        ServerConfig::default(),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/upload")
                .header("Origin", "http://localhost:5173")
                .header("Access-Control-Request-Method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "POST, OPTIONS"
    );
    assert_eq!(
        headers.get("access-control-allow-headers").unwrap(),
        "Content-Type"
    );
    assert_eq!(headers.get("access-control-max-age").unwrap(), "86400");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = app_with(
        Arc::new(MockStorageService::default()),
        ServerConfig::default(),
    );

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["storage"], "configured");
}

#[tokio::test]
async fn test_task_ids_are_unique() {
    let storage = Arc::new(MockStorageService::default());
    let service = UploadService::new(storage.clone(), "uploads");

    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        let task = service
            .accept("photo.png", Some("image/png"), Box::new(&b"x"[..]))
            .await
            .unwrap();
        assert!(seen.insert(task.id));
    }
    assert_eq!(storage.len(), 10_000);
}

#[tokio::test]
async fn test_request_logs_carry_assigned_request_id() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let app = app_with(
        Arc::new(MockStorageService::default()),
        ServerConfig::default(),
    );
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let logs = capture.contents();
    assert!(logs.contains("📥 GET /health"), "{}", logs);
    assert!(
        logs.contains(&format!("request_id={}", request_id)),
        "{}",
        logs
    );
    assert!(!logs.contains("request_id=unknown"), "{}", logs);
}

#[tokio::test]
async fn test_stored_metadata_records_upload_time() {
    let storage = Arc::new(MockStorageService::default());
    let service = UploadService::new(storage.clone(), "uploads");

    let before = chrono::Utc::now();
    let task = service
        .accept("photo.png", Some("image/png"), Box::new(&b"x"[..]))
        .await
        .unwrap();
    let after = chrono::Utc::now();

    let stored = storage.object(&task.storage_key("uploads")).unwrap();
    let uploaded_at = chrono::DateTime::parse_from_rfc3339(&stored.metadata.uploaded_at)
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert_eq!(uploaded_at, task.created_at);
    assert!(before <= uploaded_at && uploaded_at <= after);
    assert!(
        stored
            .metadata
            .user_metadata()
            .contains(&("uploadedAt", stored.metadata.uploaded_at.clone()))
    );
}
