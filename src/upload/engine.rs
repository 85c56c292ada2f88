//! # Upload Engine
//!
//! Drives a source through the full pipeline: size and SHA-1 discovery,
//! the instant-upload attempt with its possible hash challenge, then
//! the storage dispatch (single-shot PUT or multipart with resume).
//!
//! Sources that cannot be hashed up front (unknown size, one-shot
//! streams, un-ranged URLs) divert to the sample form upload, which
//! transfers content unconditionally.

use log::{debug, info};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::api::upload::{self as upload_api, InitOutcome};
use crate::client::Client;
use crate::constants::{DEFAULT_PART_SIZE, HASH_CHALLENGE_THRESHOLD};
use crate::error::Error;
use crate::oss::{multipart, OssCallback, StsToken, UploadCheckpoint};
use crate::upload::sample::upload_sample;
use crate::upload::source::{read_up_to, UploadSource};
use crate::utils::hash;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Part size for the multipart path; `None` uploads in one PUT.
    pub part_size: Option<u64>,
    /// Caller-supplied uppercase SHA-1, required for large URL sources
    /// and trusted over recomputation when present.
    pub sha1: Option<String>,
    /// Skip dedup entirely and push through the form endpoint.
    pub upload_directly: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: Some(DEFAULT_PART_SIZE),
            sha1: None,
            upload_directly: false,
        }
    }
}

/// What an upload settled into.
#[derive(Debug, Clone)]
pub struct Uploaded {
    pub file_name: String,
    pub file_size: u64,
    pub sha1: Option<String>,
    pub pickcode: Option<String>,
    pub file_id: Option<u64>,
    /// Raw booking response for diagnosis.
    pub raw: Value,
}

fn str_of(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn id_of(v: Option<&Value>) -> Option<u64> {
    match v {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn uploaded_from_booking(
    raw: Value,
    file_name: &str,
    file_size: u64,
    sha1: Option<String>,
) -> Uploaded {
    let data = raw.get("data").cloned().unwrap_or(Value::Null);
    Uploaded {
        file_name: str_of(data.get("file_name")).unwrap_or_else(|| file_name.to_string()),
        file_size,
        sha1: str_of(data.get("sha1")).or(sha1),
        pickcode: str_of(data.get("pick_code")).or_else(|| str_of(data.get("pickcode"))),
        file_id: id_of(data.get("file_id")),
        raw,
    }
}

/// Uploads a source into directory `pid`. Returns once the service has
/// booked the file; an interrupted multipart upload surfaces as
/// [`Error::MultipartAborted`] with the checkpoint to resume from.
pub async fn upload(
    client: &Client,
    mut source: UploadSource,
    pid: u64,
    filename: Option<String>,
    opts: UploadOptions,
) -> Result<Uploaded, Error> {
    let filename = filename
        .or_else(|| source.default_name())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if opts.upload_directly {
        let raw = upload_sample(client, source, &filename, pid).await?;
        return Ok(uploaded_from_booking(raw, &filename, 0, None));
    }

    // Size and hash discovery; sources that cannot answer divert to the
    // sample path.
    let (size, sha1) = match prepare(client, &mut source, &opts).await? {
        Prepared::Known { size, sha1 } => (size, sha1),
        Prepared::Sample => {
            let raw = upload_sample(client, source, &filename, pid).await?;
            return Ok(uploaded_from_booking(raw, &filename, 0, None));
        }
    };

    // Instant-upload negotiation, answering at most one hash challenge.
    let mut sign_key = String::new();
    let mut sign_val = String::new();
    let (bucket, object, callback) = loop {
        let outcome =
            upload_api::upload_init(client, &filename, size, &sha1, pid, &sign_key, &sign_val)
                .await?;
        match outcome {
            InitOutcome::Instant { pickcode } => {
                info!(target: "SDK", "instant upload hit for {filename}");
                return Ok(Uploaded {
                    file_name: filename,
                    file_size: size,
                    sha1: Some(sha1),
                    pickcode: Some(pickcode),
                    file_id: None,
                    raw: Value::Null,
                });
            }
            InitOutcome::HashChallenge {
                sign_key: key,
                range_start,
                range_end,
            } if sign_key.is_empty() => {
                debug!(target: "SDK", "hash challenge over {range_start}-{range_end}");
                if !source.is_rereadable() {
                    let raw = upload_sample(client, source, &filename, pid).await?;
                    return Ok(uploaded_from_booking(raw, &filename, size, None));
                }
                sign_val = source.range_sha1(client, range_start, range_end).await?;
                sign_key = key;
            }
            InitOutcome::HashChallenge { .. } => {
                return Err(Error::Remote(serde_json::json!({
                    "error": "repeated hash challenge",
                })));
            }
            InitOutcome::Upload {
                bucket,
                object,
                callback,
                ..
            } => break (bucket, object, callback),
        }
    };

    let raw = match opts.part_size {
        None => single_shot(client, &mut source, &bucket, &object, &callback).await?,
        Some(part_size) => {
            multipart_upload(
                client,
                &mut source,
                &bucket,
                &object,
                &callback,
                None,
                part_size,
                size,
            )
            .await?
        }
    };
    Ok(uploaded_from_booking(raw, &filename, size, Some(sha1)))
}

/// Resumes an interrupted multipart upload. The source must be the same
/// byte sequence the checkpoint was taken from.
pub async fn resume_upload(
    client: &Client,
    checkpoint: &UploadCheckpoint,
    mut source: UploadSource,
) -> Result<Uploaded, Error> {
    let raw = multipart_upload(
        client,
        &mut source,
        &checkpoint.bucket,
        &checkpoint.object,
        &checkpoint.callback,
        Some(checkpoint.upload_id.clone()),
        checkpoint.part_size,
        checkpoint.file_size,
    )
    .await?;
    Ok(uploaded_from_booking(raw, "", checkpoint.file_size, None))
}

/// Explicitly abandons a checkpointed upload on the server.
pub async fn abort(client: &Client, checkpoint: &UploadCheckpoint) -> Result<(), Error> {
    let url = client
        .upload_endpoint_url(&checkpoint.bucket, &checkpoint.object)
        .await?;
    let sts = client.upload_sts().await?;
    multipart::abort_upload(
        client,
        &checkpoint.bucket,
        &checkpoint.object,
        &url,
        &sts,
        &checkpoint.upload_id,
    )
    .await?;
    Ok(())
}

enum Prepared {
    Known { size: u64, sha1: String },
    Sample,
}

async fn prepare(
    client: &Client,
    source: &mut UploadSource,
    opts: &UploadOptions,
) -> Result<Prepared, Error> {
    let supplied = opts.sha1.as_ref().map(|s| s.to_ascii_uppercase());
    match source {
        UploadSource::Buffer(data) => {
            let sha1 = supplied.unwrap_or_else(|| hash::sha1_hex_upper(data));
            Ok(Prepared::Known {
                size: data.len() as u64,
                sha1,
            })
        }
        UploadSource::Path(path) => {
            let size = tokio::fs::metadata(&*path).await?.len();
            if size < HASH_CHALLENGE_THRESHOLD {
                let data = tokio::fs::read(&*path).await?;
                let sha1 = supplied.unwrap_or_else(|| hash::sha1_hex_upper(&data));
                *source = UploadSource::Buffer(data);
                return Ok(Prepared::Known { size, sha1 });
            }
            let sha1 = match supplied {
                Some(s) => s,
                None => hash::sha1_of_file(path).await?.0,
            };
            Ok(Prepared::Known { size, sha1 })
        }
        UploadSource::Url(url) => {
            let (size, ranged) = probe_url(client, url).await?;
            match size {
                Some(size) if size < HASH_CHALLENGE_THRESHOLD => {
                    let data = client
                        .http()
                        .get(&*url)
                        .send()
                        .await?
                        .error_for_status()?
                        .bytes()
                        .await?
                        .to_vec();
                    let sha1 = supplied.unwrap_or_else(|| hash::sha1_hex_upper(&data));
                    let size = data.len() as u64;
                    *source = UploadSource::Buffer(data);
                    Ok(Prepared::Known { size, sha1 })
                }
                Some(size) => match supplied {
                    // Hashing a remote body would cost a full transfer,
                    // so a large URL needs its hash supplied and range
                    // support for the challenge.
                    Some(sha1) if ranged => Ok(Prepared::Known { size, sha1 }),
                    _ => Ok(Prepared::Sample),
                },
                None => Ok(Prepared::Sample),
            }
        }
        UploadSource::Stream { size, .. } => {
            let declared = *size;
            match declared {
                Some(size) if size < HASH_CHALLENGE_THRESHOLD => {
                    let mut reader = source.open_at(client, 0).await?;
                    let data = read_up_to(&mut reader, size).await?;
                    let sha1 = supplied.unwrap_or_else(|| hash::sha1_hex_upper(&data));
                    let size = data.len() as u64;
                    *source = UploadSource::Buffer(data);
                    Ok(Prepared::Known { size, sha1 })
                }
                Some(size) => match supplied {
                    // A one-shot stream cannot answer a range challenge,
                    // but a supplied hash still earns the instant-upload
                    // attempt before any bytes move.
                    Some(sha1) => Ok(Prepared::Known { size, sha1 }),
                    None => Ok(Prepared::Sample),
                },
                None => Ok(Prepared::Sample),
            }
        }
    }
}

/// One ranged byte tells us the total size and whether the server
/// honors ranges.
async fn probe_url(client: &Client, url: &str) -> Result<(Option<u64>, bool), Error> {
    let resp = client
        .http()
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send()
        .await?
        .error_for_status()?;
    if resp.status().as_u16() == 206 {
        let total = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse().ok());
        return Ok((total, true));
    }
    Ok((resp.content_length(), false))
}

async fn single_shot(
    client: &Client,
    source: &mut UploadSource,
    bucket: &str,
    object: &str,
    callback: &OssCallback,
) -> Result<Value, Error> {
    let url = client.upload_endpoint_url(bucket, object).await?;
    let sts = client.upload_sts().await?;
    let reader = source.open_at(client, 0).await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
    multipart::put_object(client, bucket, object, &url, &sts, callback, body).await
}

fn sts_expired(err: &Error) -> bool {
    matches!(err, Error::Remote(v) if v.get("oss_status").and_then(Value::as_u64) == Some(403))
}

#[allow(clippy::too_many_arguments)]
async fn multipart_upload(
    client: &Client,
    source: &mut UploadSource,
    bucket: &str,
    object: &str,
    callback: &OssCallback,
    upload_id: Option<String>,
    part_size: u64,
    file_size: u64,
) -> Result<Value, Error> {
    if part_size == 0 {
        return Err(Error::Custom("part size must be positive".into()));
    }
    let url = client.upload_endpoint_url(bucket, object).await?;
    let mut sts = client.upload_sts().await?;

    // Resume accepts only a contiguous prefix of full-sized parts; the
    // first short or missing part restarts from there.
    let mut parts = Vec::new();
    let upload_id = match upload_id {
        Some(id) => {
            let mut listed = multipart::list_parts(client, bucket, object, &url, &sts, &id).await?;
            listed.sort_by_key(|p| p.part_number);
            for part in listed {
                if part.part_number == parts.len() as u32 + 1 && part.size == part_size {
                    parts.push(part);
                } else {
                    break;
                }
            }
            debug!(target: "SDK", "resuming {id} after {} complete parts", parts.len());
            id
        }
        None => multipart::init_upload(client, bucket, object, &url, &sts).await?,
    };

    let checkpoint = UploadCheckpoint {
        bucket: bucket.to_string(),
        object: object.to_string(),
        upload_id: upload_id.clone(),
        callback: callback.clone(),
        part_size,
        file_size,
    };

    let result = drive_parts(
        client, source, bucket, object, &url, &mut sts, &upload_id, callback, part_size, parts,
    )
    .await;
    result.map_err(|e| Error::MultipartAborted {
        checkpoint: Box::new(checkpoint),
        source: Box::new(e),
    })
}

#[allow(clippy::too_many_arguments)]
async fn drive_parts(
    client: &Client,
    source: &mut UploadSource,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &mut StsToken,
    upload_id: &str,
    callback: &OssCallback,
    part_size: u64,
    mut parts: Vec<crate::oss::Part>,
) -> Result<Value, Error> {
    let skip: u64 = parts.iter().map(|p| p.size).sum();
    let mut reader = source.open_at(client, skip).await?;
    let mut part_number = parts.len() as u32 + 1;
    loop {
        let chunk = read_up_to(&mut reader, part_size).await?;
        if chunk.is_empty() && part_number > 1 {
            break;
        }
        let size = chunk.len() as u64;
        let part = match multipart::upload_part(
            client,
            bucket,
            object,
            url,
            sts,
            upload_id,
            part_number,
            chunk.clone(),
        )
        .await
        {
            Err(e) if sts_expired(&e) => {
                client.invalidate_sts().await;
                *sts = client.upload_sts().await?;
                multipart::upload_part(
                    client,
                    bucket,
                    object,
                    url,
                    sts,
                    upload_id,
                    part_number,
                    chunk,
                )
                .await?
            }
            other => other?,
        };
        parts.push(part);
        part_number += 1;
        if size < part_size {
            break;
        }
    }
    multipart::complete_upload(client, bucket, object, url, sts, upload_id, callback, &parts).await
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{prepare, sts_expired, uploaded_from_booking, Prepared, UploadOptions};
    use crate::error::Error;
    use crate::upload::source::{ByteStream, UploadSource};

    #[test]
    fn test_options_default_to_multipart() {
        let opts = UploadOptions::default();
        assert_eq!(opts.part_size, Some(10 * 1024 * 1024));
        assert!(!opts.upload_directly);
    }

    #[test]
    fn test_booking_extraction() {
        let raw = json!({
            "state": true,
            "data": {
                "file_id": "2593093001609739968",
                "file_name": "movie.mkv",
                "pick_code": "pc123",
                "sha1": "ABCD",
            },
        });
        let got = uploaded_from_booking(raw, "fallback", 42, None);
        assert_eq!(got.file_id, Some(2593093001609739968));
        assert_eq!(got.pickcode.as_deref(), Some("pc123"));
        assert_eq!(got.file_name, "movie.mkv");
        assert_eq!(got.file_size, 42);
        assert_eq!(got.sha1.as_deref(), Some("ABCD"));
    }

    #[test]
    fn test_booking_extraction_fallbacks() {
        let got = uploaded_from_booking(json!({"state": true}), "name.bin", 7, Some("FF".into()));
        assert_eq!(got.file_name, "name.bin");
        assert_eq!(got.sha1.as_deref(), Some("FF"));
        assert!(got.pickcode.is_none());
        assert!(got.file_id.is_none());
    }

    #[test]
    fn test_sts_expiry_detection() {
        let expired = Error::Remote(json!({"oss_status": 403, "body": "expired"}));
        assert!(sts_expired(&expired));
        let other = Error::Remote(json!({"oss_status": 404}));
        assert!(!sts_expired(&other));
        assert!(!sts_expired(&Error::Custom("x".into())));
    }

    fn large_stream() -> ByteStream {
        Box::pin(futures_util::stream::iter(vec![Ok(vec![0u8; 8])]))
    }

    #[tokio::test]
    async fn test_prepare_large_stream_with_supplied_hash() {
        let client = crate::client::Client::new("UID=1; CID=2; SEID=3").unwrap();
        let size = 4 * 1024 * 1024;
        let mut source = UploadSource::from_stream(Some(size), large_stream());
        let opts = UploadOptions {
            sha1: Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string()),
            ..Default::default()
        };
        // A supplied hash earns the instant-upload attempt even though
        // the stream itself cannot be hashed or re-read.
        match prepare(&client, &mut source, &opts).await.unwrap() {
            Prepared::Known { size: got, sha1 } => {
                assert_eq!(got, size);
                assert_eq!(sha1, "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709");
            }
            Prepared::Sample => panic!("supplied hash should not divert to sample"),
        }

        // Without the hash, a large stream still goes to the sample path.
        let mut source = UploadSource::from_stream(Some(size), large_stream());
        let opts = UploadOptions::default();
        assert!(matches!(
            prepare(&client, &mut source, &opts).await.unwrap(),
            Prepared::Sample
        ));

        // So does a stream of unknown size, which cannot fill in the
        // init payload's filesize.
        let mut source = UploadSource::from_stream(None, large_stream());
        assert!(matches!(
            prepare(&client, &mut source, &opts).await.unwrap(),
            Prepared::Sample
        ));
    }
}
