//! # Sample Upload
//!
//! The web form-upload path. No dedup, no hashes: the service signs the
//! form, the storage backend ingests the multipart POST directly. Used
//! for sources whose size or content cannot be known up front.

use log::debug;
use mime_guess::from_path;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::api::upload as upload_api;
use crate::client::Client;
use crate::error::{check_response, Error};
use crate::upload::source::UploadSource;

/// Uploads a source via the form endpoint, returning the service's
/// booking response.
pub async fn upload_sample(
    client: &Client,
    source: UploadSource,
    filename: &str,
    pid: u64,
) -> Result<Value, Error> {
    let init = upload_api::sample_init(client, filename, pid).await?;
    debug!(target: "SDK", "sample upload of {filename} into {}", init.object);

    let mime = from_path(filename).first_or_octet_stream();
    let part = match source {
        UploadSource::Buffer(data) => Part::bytes(data),
        mut other => {
            let reader = other.open_at(client, 0).await?;
            Part::stream(Body::wrap_stream(ReaderStream::new(reader)))
        }
    };
    let part = part
        .file_name(filename.to_string())
        .mime_str(mime.essence_str())
        .map_err(|e| Error::Custom(format!("bad mime type: {e}")))?;

    let form = Form::new()
        .text("name", filename.to_string())
        .text("key", init.object)
        .text("policy", init.policy)
        .text("OSSAccessKeyId", init.accessid)
        .text("success_action_status", "200")
        .text("callback", init.callback)
        .text("signature", init.signature)
        .part("file", part);

    let resp = client.http().post(&init.host).multipart(form).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Remote(serde_json::json!({
            "sample_status": status.as_u16(),
            "body": resp.text().await.unwrap_or_default(),
        })));
    }
    check_response(resp.json::<Value>().await?)
}
