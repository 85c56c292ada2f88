//! # Storage Transfer Driver
//!
//! The verbs against the object-storage backend: single-shot PUT,
//! multipart init / part / complete / abort, and the part listing the
//! resume path replays. Every request carries the OSS signature and the
//! STS security token.

use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;
use serde_json::Value;

use crate::client::Client;
use crate::error::Error;
use crate::oss::{sign, OssCallback, Part, StsToken};

fn to_base64(s: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(s)
}

#[allow(clippy::too_many_arguments)]
async fn send(
    client: &Client,
    method: Method,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    params: &[(String, String)],
    extra_headers: &[(String, String)],
    body: Option<reqwest::Body>,
) -> Result<reqwest::Response, Error> {
    let mut sign_headers = vec![(
        "x-oss-security-token".to_string(),
        sts.security_token.clone(),
    )];
    sign_headers.extend_from_slice(extra_headers);
    let signed = sign::sign_request(sts, method.as_str(), bucket, object, params, &sign_headers);

    let mut req = client.http().request(method, url);
    let query: Vec<&(String, String)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    if !query.is_empty() {
        req = req.query(&query);
    }
    req = req
        .header("date", &signed.date)
        .header("authorization", &signed.authorization);
    for (k, v) in &sign_headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(body) = body {
        req = req.body(body);
    }
    Ok(req.send().await?)
}

async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        return Err(Error::Transient(format!("oss HTTP {status}: {body}")));
    }
    Err(Error::Remote(serde_json::json!({
        "oss_status": status.as_u16(),
        "body": body,
    })))
}

/// Starts a multipart upload, returning the upload id.
pub async fn init_upload(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
) -> Result<String, Error> {
    // The bare `uploads` subresource is part of the canonical resource
    // but carries no value, so the query is appended by hand.
    let resp = send(
        client,
        Method::POST,
        bucket,
        object,
        &format!("{url}?uploads"),
        sts,
        &[("uploads".to_string(), String::new())],
        &[],
        None,
    )
    .await?;
    let xml = expect_success(resp).await?.text().await?;
    let upload_id = parse_upload_id(&xml)?;
    debug!(target: "SDK", "multipart upload {upload_id} started for {object}");
    Ok(upload_id)
}

/// Uploads one part. Part numbers are 1-based; any part but the last
/// must be exactly the negotiated part size.
pub async fn upload_part(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    upload_id: &str,
    part_number: u32,
    data: Vec<u8>,
) -> Result<Part, Error> {
    let size = data.len() as u64;
    let params = vec![
        ("partNumber".to_string(), part_number.to_string()),
        ("uploadId".to_string(), upload_id.to_string()),
    ];
    let resp = send(
        client,
        Method::PUT,
        bucket,
        object,
        url,
        sts,
        &params,
        &[],
        Some(data.into()),
    )
    .await?;
    let resp = expect_success(resp).await?;
    let etag = resp
        .headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Custom("part response without ETag".into()))?
        .to_string();
    Ok(Part {
        part_number,
        etag,
        size,
    })
}

/// Lists the parts the server already holds for an upload id, following
/// the part-number-marker pagination to the end.
pub async fn list_parts(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    upload_id: &str,
) -> Result<Vec<Part>, Error> {
    let mut parts = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let mut params = vec![("uploadId".to_string(), upload_id.to_string())];
        if let Some(m) = &marker {
            params.push(("part-number-marker".to_string(), m.clone()));
        }
        let resp = send(
            client,
            Method::GET,
            bucket,
            object,
            url,
            sts,
            &params,
            &[],
            None,
        )
        .await?;
        let xml = expect_success(resp).await?.text().await?;
        let page = parse_list_parts(&xml)?;
        parts.extend(page.parts);
        if !page.truncated {
            return Ok(parts);
        }
        marker = page.next_marker;
    }
}

/// Completes a multipart upload. The completion response is the
/// service's callback return, which books the file.
pub async fn complete_upload(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    upload_id: &str,
    callback: &OssCallback,
    parts: &[Part],
) -> Result<Value, Error> {
    let mut parts: Vec<&Part> = parts.iter().collect();
    parts.sort_by_key(|p| p.part_number);
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    let headers = vec![
        ("x-oss-callback".to_string(), to_base64(&callback.callback)),
        (
            "x-oss-callback-var".to_string(),
            to_base64(&callback.callback_var),
        ),
    ];
    let resp = send(
        client,
        Method::POST,
        bucket,
        object,
        url,
        sts,
        &[("uploadId".to_string(), upload_id.to_string())],
        &headers,
        Some(body.into_bytes().into()),
    )
    .await?;
    let resp = expect_success(resp).await?;
    Ok(resp.json::<Value>().await?)
}

/// Abandons a multipart upload. A missing upload id counts as done.
pub async fn abort_upload(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    upload_id: &str,
) -> Result<bool, Error> {
    let resp = send(
        client,
        Method::DELETE,
        bucket,
        object,
        url,
        sts,
        &[("uploadId".to_string(), upload_id.to_string())],
        &[],
        None,
    )
    .await?;
    let status = resp.status();
    Ok(status.is_success() || status.as_u16() == 404)
}

/// Single-shot PUT of the whole object, with the callback headers the
/// service uses to book the file.
pub async fn put_object(
    client: &Client,
    bucket: &str,
    object: &str,
    url: &str,
    sts: &StsToken,
    callback: &OssCallback,
    body: reqwest::Body,
) -> Result<Value, Error> {
    let headers = vec![
        ("x-oss-callback".to_string(), to_base64(&callback.callback)),
        (
            "x-oss-callback-var".to_string(),
            to_base64(&callback.callback_var),
        ),
    ];
    let resp = send(
        client,
        Method::PUT,
        bucket,
        object,
        url,
        sts,
        &[],
        &headers,
        Some(body),
    )
    .await?;
    let resp = expect_success(resp).await?;
    Ok(resp.json::<Value>().await?)
}

fn parse_upload_id(xml: &str) -> Result<String, Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_upload_id = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"UploadId" => in_upload_id = true,
            Event::Text(text) if in_upload_id => return Ok(text.unescape()?.into_owned()),
            Event::Eof => return Err(Error::Custom("init response without UploadId".into())),
            _ => (),
        }
    }
}

pub(crate) struct PartListing {
    pub parts: Vec<Part>,
    pub truncated: bool,
    pub next_marker: Option<String>,
}

fn parse_list_parts(xml: &str) -> Result<PartListing, Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut listing = PartListing {
        parts: Vec::new(),
        truncated: false,
        next_marker: None,
    };
    let mut current: Option<Part> = None;
    let mut field: Vec<u8> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.name().as_ref() == b"Part" {
                    current = Some(Part {
                        part_number: 0,
                        etag: String::new(),
                        size: 0,
                    });
                }
                field = e.name().as_ref().to_vec();
            }
            Event::Text(text) => {
                let value = text.unescape()?.into_owned();
                if let Some(part) = current.as_mut() {
                    match field.as_slice() {
                        b"PartNumber" => {
                            part.part_number = value
                                .parse()
                                .map_err(|_| Error::Custom("bad PartNumber".into()))?
                        }
                        b"ETag" => part.etag = value,
                        b"Size" => {
                            part.size =
                                value.parse().map_err(|_| Error::Custom("bad Size".into()))?
                        }
                        _ => (),
                    }
                } else {
                    match field.as_slice() {
                        b"IsTruncated" => listing.truncated = value == "true",
                        b"NextPartNumberMarker" => listing.next_marker = Some(value),
                        _ => (),
                    }
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"Part" {
                    if let Some(part) = current.take() {
                        listing.parts.push(part);
                    }
                }
                field.clear();
            }
            Event::Eof => return Ok(listing),
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{parse_list_parts, parse_upload_id};

    #[test]
    fn test_parse_upload_id() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult>
  <Bucket>fhnfile</Bucket>
  <Key>object/key</Key>
  <UploadId>0004B9894A22E5B1888A1E29F823</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(
            parse_upload_id(xml).unwrap(),
            "0004B9894A22E5B1888A1E29F823"
        );
        assert!(parse_upload_id("<Empty/>").is_err());
    }

    #[test]
    fn test_parse_list_parts() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListPartsResult>
  <Bucket>fhnfile</Bucket>
  <UploadId>0004B999EF5A239BB9138C6227D6</UploadId>
  <NextPartNumberMarker>2</NextPartNumberMarker>
  <MaxParts>1000</MaxParts>
  <IsTruncated>true</IsTruncated>
  <Part>
    <PartNumber>1</PartNumber>
    <LastModified>2012-02-23T07:01:34.000Z</LastModified>
    <ETag>"3349DC700140D7F86A0784842780"</ETag>
    <HashCrc64ecma>12345</HashCrc64ecma>
    <Size>10485760</Size>
  </Part>
  <Part>
    <PartNumber>2</PartNumber>
    <LastModified>2012-02-23T07:01:34.000Z</LastModified>
    <ETag>"3349DC700140D7F86A0784842781"</ETag>
    <HashCrc64ecma>12346</HashCrc64ecma>
    <Size>10485760</Size>
  </Part>
</ListPartsResult>"#;
        let listing = parse_list_parts(xml).unwrap();
        assert_eq!(listing.parts.len(), 2);
        assert!(listing.truncated);
        assert_eq!(listing.next_marker.as_deref(), Some("2"));
        assert_eq!(listing.parts[0].part_number, 1);
        assert_eq!(listing.parts[0].size, 10_485_760);
        assert_eq!(listing.parts[1].etag, "\"3349DC700140D7F86A0784842781\"");
    }

    #[test]
    fn test_parse_list_parts_final_page() {
        let xml = r#"<ListPartsResult><IsTruncated>false</IsTruncated></ListPartsResult>"#;
        let listing = parse_list_parts(xml).unwrap();
        assert!(listing.parts.is_empty());
        assert!(!listing.truncated);
        assert!(listing.next_marker.is_none());
    }
}
