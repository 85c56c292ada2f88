//! # Upload Endpoints
//!
//! The upload-initialization binding with its signature fields, plus
//! the sample-upload init. Initialization requests travel inside the
//! ECDH envelope with the `k_ec` token on the query string; the
//! response comes back in the same envelope.
//!
//! A single init call resolves to one of three outcomes: an instant hit
//! (the server already has the content), a hash challenge (prove
//! possession of a byte range, then retry), or a go-ahead with the
//! storage bucket/object/callback triple.

use chrono::Utc;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::client::Client;
use crate::config;
use crate::constants::{APP_VERSION, MD5_SALT};
use crate::crypto::ecdh::EcdhCipher;
use crate::error::Error;
use crate::oss::OssCallback;

/// Target string for the init payloads: `U_1_<parent id>`.
pub fn target_of(pid: u64) -> String {
    format!("U_1_{pid}")
}

/// What an upload-init round resolved to.
#[derive(Debug)]
pub enum InitOutcome {
    /// Server-side dedup hit; no bytes move.
    Instant { pickcode: String },
    /// Prove possession of the inclusive byte range, then call again
    /// with `sign_key`/`sign_val` filled in.
    HashChallenge {
        sign_key: String,
        range_start: u64,
        range_end: u64,
    },
    /// No dedup; push the content to the storage backend.
    Upload {
        bucket: String,
        object: String,
        callback: OssCallback,
        pickcode: Option<String>,
    },
}

fn gen_sig(user_id: u64, user_key: &str, file_sha1: &str, target: &str) -> String {
    let inner = Sha1::digest(format!("{user_id}{file_sha1}{target}0").as_bytes());
    let mut outer = Sha1::new();
    outer.update(user_key.as_bytes());
    outer.update(hex::encode(inner).as_bytes());
    outer.update(b"000000");
    hex::encode_upper(outer.finalize())
}

fn gen_token(
    file_sha1: &str,
    file_size: u64,
    sign_key: &str,
    sign_val: &str,
    user_id: u64,
    t: i64,
) -> String {
    let mut ctx = md5::Context::new();
    ctx.consume(MD5_SALT);
    ctx.consume(format!("{file_sha1}{file_size}{sign_key}{sign_val}{user_id}{t}").as_bytes());
    ctx.consume(hex::encode(md5::compute(user_id.to_string().as_bytes()).0).as_bytes());
    ctx.consume(APP_VERSION.as_bytes());
    format!("{:x}", ctx.compute())
}

#[allow(clippy::too_many_arguments)]
fn build_init_form(
    user_id: u64,
    filename: &str,
    file_size: u64,
    file_sha1: &str,
    target: &str,
    sig: &str,
    t: i64,
    token: &str,
    sign_key: &str,
    sign_val: &str,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("appid".to_string(), "0".to_string()),
        ("appversion".to_string(), APP_VERSION.to_string()),
        ("fileid".to_string(), file_sha1.to_string()),
        ("filename".to_string(), filename.to_string()),
        ("filesize".to_string(), file_size.to_string()),
        ("sig".to_string(), sig.to_string()),
        ("t".to_string(), t.to_string()),
        ("target".to_string(), target.to_string()),
        ("token".to_string(), token.to_string()),
        ("userid".to_string(), user_id.to_string()),
    ];
    if !sign_key.is_empty() && !sign_val.is_empty() {
        form.push(("sign_key".to_string(), sign_key.to_string()));
        form.push(("sign_val".to_string(), sign_val.to_string()));
    }
    form.sort_by(|a, b| a.0.cmp(&b.0));
    form
}

/// One round of the upload-init negotiation. `file_sha1` must be
/// uppercase hex; `sign_key`/`sign_val` are empty on the first round.
#[allow(clippy::too_many_arguments)]
pub async fn upload_init(
    client: &Client,
    filename: &str,
    file_size: u64,
    file_sha1: &str,
    pid: u64,
    sign_key: &str,
    sign_val: &str,
) -> Result<InitOutcome, Error> {
    let info = client.upload_info().await?;
    let cipher = EcdhCipher::new()?;
    let target = target_of(pid);
    let t = Utc::now().timestamp();
    let sig = gen_sig(info.user_id, &info.user_key, file_sha1, &target);
    let token = gen_token(file_sha1, file_size, sign_key, sign_val, info.user_id, t);
    let form = build_init_form(
        info.user_id,
        filename,
        file_size,
        file_sha1,
        &target,
        &sig,
        t,
        &token,
        sign_key,
        sign_val,
    );
    let encoded_form = serde_urlencoded::to_string(&form)
        .map_err(|e| Error::Custom(format!("init form encode: {e}")))?;
    let body = cipher.encode(encoded_form.as_bytes());
    let k_ec = cipher.encode_token(t as u32);
    let api = format!("{}/4.0/initupload.php", config::get_upload_api());
    let raw = client
        .post_bytes(
            &api,
            &[("k_ec", k_ec)],
            body,
            "application/x-www-form-urlencoded",
        )
        .await?;
    let decoded = cipher.decode(&raw, false)?;
    let resp: Value = serde_json::from_slice(&decoded)
        .map_err(|e| Error::CryptoMismatch(format!("init payload: {e}")))?;
    parse_init_outcome(resp)
}

fn parse_init_outcome(resp: Value) -> Result<InitOutcome, Error> {
    let status = resp.get("status").and_then(Value::as_i64).unwrap_or(-1);
    let statuscode = resp.get("statuscode").and_then(Value::as_i64).unwrap_or(0);
    match (status, statuscode) {
        (2, 0) => {
            let pickcode = resp
                .get("pickcode")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Remote(resp.clone()))?
                .to_string();
            Ok(InitOutcome::Instant { pickcode })
        }
        (7, 701) => {
            let sign_key = resp
                .get("sign_key")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Remote(resp.clone()))?
                .to_string();
            let sign_check = resp
                .get("sign_check")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Remote(resp.clone()))?;
            let (start, end) = sign_check
                .split_once('-')
                .and_then(|(s, e)| Some((s.parse().ok()?, e.parse().ok()?)))
                .ok_or_else(|| Error::Remote(resp.clone()))?;
            Ok(InitOutcome::HashChallenge {
                sign_key,
                range_start: start,
                range_end: end,
            })
        }
        (1, 0) => {
            let bucket = resp
                .get("bucket")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Remote(resp.clone()))?
                .to_string();
            let object = resp
                .get("object")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Remote(resp.clone()))?
                .to_string();
            let callback: OssCallback = serde_json::from_value(
                resp.get("callback")
                    .cloned()
                    .ok_or_else(|| Error::Remote(resp.clone()))?,
            )
            .map_err(|_| Error::Remote(resp.clone()))?;
            let pickcode = resp
                .get("pickcode")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(InitOutcome::Upload {
                bucket,
                object,
                callback,
                pickcode,
            })
        }
        _ => Err(Error::Remote(resp)),
    }
}

/// Fields the sample-upload form endpoint hands back for the follow-up
/// multipart POST.
#[derive(Debug, serde::Deserialize)]
pub struct SampleInit {
    pub host: String,
    pub object: String,
    pub policy: String,
    pub accessid: String,
    pub callback: String,
    pub signature: String,
}

/// Initializes a sample (form) upload. No dedup on this path.
pub async fn sample_init(client: &Client, filename: &str, pid: u64) -> Result<SampleInit, Error> {
    let api = format!("{}/3.0/sampleinitupload.php", config::get_upload_api());
    let form = vec![
        ("filename".to_string(), filename.to_string()),
        ("target".to_string(), target_of(pid)),
    ];
    let resp = client.post_form_json(&api, &form).await?;
    Ok(serde_json::from_value(resp)?)
}
