pub mod gcs;
pub mod storage;
pub mod upload_service;
