//! # Error Types
//!
//! Crate-wide error enum plus the response classifier that maps the
//! service's JSON failure envelopes onto typed error kinds.
//!
//! Every JSON response from the service is an object with a boolean-like
//! `state` field; failures populate one of `errno`, `errNo` or `code`.
//! [`check_response`] inspects all three and raises the matching kind,
//! preserving the raw payload for diagnosis.

use serde_json::Value;
use thiserror::Error;

use crate::oss::UploadCheckpoint;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication required: {0}")]
    AuthRequired(Value),

    #[error("not found: {0}")]
    NotFound(Value),

    #[error("name already exists: {0}")]
    AlreadyExists(Value),

    #[error("invalid argument: {0}")]
    InvalidArgument(Value),

    #[error("operation refused by server: {0}")]
    Unsupported(Value),

    #[error("storage quota exhausted: {0}")]
    NoSpace(Value),

    #[error("previous batch operation still running: {0}")]
    Busy(Value),

    /// Any failure envelope with an unrecognized code. The raw response
    /// is preserved.
    #[error("remote error: {0}")]
    Remote(Value),

    #[error("transient transport failure: {0}")]
    Transient(String),

    /// A response failed to decode under the expected envelope. Not
    /// retryable; indicates corruption or a protocol change.
    #[error("envelope decode failure: {0}")]
    CryptoMismatch(String),

    /// A multipart upload was interrupted. Carries the checkpoint the
    /// caller passes back to resume; this is the documented resume
    /// signal, not a failure to swallow.
    #[error("multipart upload aborted, resumable: {source}")]
    MultipartAborted {
        checkpoint: Box<UploadCheckpoint>,
        #[source]
        source: Box<Error>,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Custom(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Custom(msg)
    }
}

impl Error {
    /// The resume checkpoint, when this error is the multipart abort
    /// signal.
    pub fn checkpoint(&self) -> Option<&UploadCheckpoint> {
        match self {
            Error::MultipartAborted { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::Null => false,
        _ => true,
    }
}

fn code_of(resp: &Value, key: &str) -> Option<i64> {
    resp.get(key).and_then(Value::as_i64)
}

/// Checks a service response, returning it untouched on success and the
/// typed error kind otherwise.
pub fn check_response(resp: Value) -> Result<Value, Error> {
    if resp.get("state").map(truthy).unwrap_or(true) {
        return Ok(resp);
    }
    if let Some(errno) = code_of(&resp, "errno") {
        return Err(match errno {
            99 | 911 | 40101032 => Error::AuthRequired(resp),
            20004 => Error::AlreadyExists(resp),
            20009 | 90008 | 231011 => Error::NotFound(resp),
            91002 | 91004 | 990023 => Error::Unsupported(resp),
            91005 => Error::NoSpace(resp),
            990009 => Error::Busy(resp),
            40100000 => Error::InvalidArgument(resp),
            _ => Error::Remote(resp),
        });
    }
    if let Some(errno) = code_of(&resp, "errNo") {
        if errno == 990001 {
            return Err(Error::AuthRequired(resp));
        }
    }
    if let Some(code) = code_of(&resp, "code") {
        return Err(match code {
            20018 => Error::NotFound(resp),
            990002 => Error::InvalidArgument(resp),
            _ => Error::Remote(resp),
        });
    }
    Err(Error::Remote(resp))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{check_response, Error};

    #[test]
    fn test_success_passthrough() {
        let resp = json!({"state": true, "data": [1, 2, 3]});
        assert!(check_response(resp).is_ok());
        // A response without a state field counts as success.
        assert!(check_response(json!({"count": 0})).is_ok());
    }

    #[test]
    fn test_auth_codes() {
        for errno in [99, 911, 40101032] {
            let resp = json!({"state": false, "errno": errno});
            assert!(matches!(check_response(resp), Err(Error::AuthRequired(_))));
        }
        let resp = json!({"state": false, "errNo": 990001});
        assert!(matches!(check_response(resp), Err(Error::AuthRequired(_))));
    }

    #[test]
    fn test_fs_codes() {
        let resp = json!({"state": false, "errno": 20004});
        assert!(matches!(check_response(resp), Err(Error::AlreadyExists(_))));
        let resp = json!({"state": false, "errno": 20009});
        assert!(matches!(check_response(resp), Err(Error::NotFound(_))));
        let resp = json!({"state": false, "code": 20018});
        assert!(matches!(check_response(resp), Err(Error::NotFound(_))));
        let resp = json!({"state": false, "code": 990002});
        assert!(matches!(
            check_response(resp),
            Err(Error::InvalidArgument(_))
        ));
        let resp = json!({"state": false, "errno": 91005});
        assert!(matches!(check_response(resp), Err(Error::NoSpace(_))));
        let resp = json!({"state": false, "errno": 990009});
        assert!(matches!(check_response(resp), Err(Error::Busy(_))));
    }

    #[test]
    fn test_numeric_state() {
        // Some endpoints report state as 0/1 rather than a boolean.
        let resp = json!({"state": 0, "errno": 40100000, "code": 40100000});
        assert!(matches!(
            check_response(resp),
            Err(Error::InvalidArgument(_))
        ));
        assert!(check_response(json!({"state": 1})).is_ok());
    }

    #[test]
    fn test_unknown_code_is_remote() {
        let resp = json!({"state": false, "errno": 123456789});
        assert!(matches!(check_response(resp), Err(Error::Remote(_))));
        let resp = json!({"state": false});
        assert!(matches!(check_response(resp), Err(Error::Remote(_))));
    }
}
