//! Aliyun-compatible object-storage backend the service hands bulk data
//! to. Request signing lives in [`sign`], the transfer driver in
//! [`multipart`].

pub mod multipart;
pub mod sign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Short-lived credential triple issued by the service for direct
/// storage access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StsToken {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: String,
    pub expiration: DateTime<Utc>,
}

/// Opaque callback blob the service expects echoed, base64-encoded, on
/// upload completion. It books the upload into the file tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OssCallback {
    pub callback: String,
    pub callback_var: String,
}

/// One uploaded part, as the driver records it and the completion body
/// lists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Everything needed to resume an interrupted multipart upload. JSON
/// serializable; the caller re-supplies the source bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub callback: OssCallback,
    pub part_size: u64,
    pub file_size: u64,
}
