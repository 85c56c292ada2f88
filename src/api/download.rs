//! # Download-URL Negotiation
//!
//! The app endpoint wraps both request and response in the RSA
//! envelope; the web variant is plain JSON but echoes a cookie that
//! must accompany the eventual fetch. Either way the returned URL is
//! time-limited and only honored with the headers returned here.

use reqwest::Url;
use serde_json::{json, Value};

use crate::client::Client;
use crate::config;
use crate::crypto::rsa::RsaCipher;
use crate::error::Error;

/// A negotiated, time-limited download location.
#[derive(Debug, Clone)]
pub struct DownloadUrl {
    pub url: String,
    pub file_id: u64,
    pub pickcode: String,
    pub file_name: String,
    pub file_size: u64,
    /// Directories negotiate successfully but yield an empty URL.
    pub is_directory: bool,
    /// Headers that must be sent when fetching the URL.
    pub headers: Vec<(String, String)>,
    /// Unix-seconds expiry carried in the URL's `t` parameter.
    pub expires_at: Option<u64>,
}

fn expiry_of(url: &str) -> Option<u64> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "t")
        .and_then(|(_, v)| v.parse().ok())
}

/// Negotiates a download URL for a pickcode via the enveloped app
/// endpoint.
pub async fn download_url_app(client: &Client, pickcode: &str) -> Result<DownloadUrl, Error> {
    let cipher = RsaCipher::new();
    let payload = json!({ "pickcode": pickcode }).to_string();
    let form = vec![("data".to_string(), cipher.encode(payload.as_bytes()))];
    let api = format!("{}/app/chrome/downurl", config::get_pro_api());
    let resp = client.post_form_json(&api, &form).await?;
    if !resp.get("state").and_then(Value::as_bool).unwrap_or(false) {
        return Err(Error::NotFound(resp));
    }
    let data = resp
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::CryptoMismatch("downurl response without data".into()))?;
    let decoded = cipher.decode(data)?;
    let data: Value = serde_json::from_slice(&decoded)
        .map_err(|e| Error::CryptoMismatch(format!("downurl payload: {e}")))?;
    let headers = vec![("User-Agent".to_string(), client.user_agent().to_string())];
    parse_app_payload(&data, pickcode, headers)
}

fn parse_app_payload(
    data: &Value,
    pickcode: &str,
    headers: Vec<(String, String)>,
) -> Result<DownloadUrl, Error> {
    let entries = data
        .as_object()
        .ok_or_else(|| Error::CryptoMismatch("downurl payload is not an object".into()))?;
    let (fid, info) = entries
        .iter()
        .next()
        .ok_or_else(|| Error::NotFound(json!({ "pickcode": pickcode })))?;
    let url = info
        .get("url")
        .and_then(|u| u.get("url"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Ok(DownloadUrl {
        expires_at: expiry_of(&url),
        is_directory: url.is_empty(),
        url,
        file_id: fid.parse().unwrap_or(0),
        pickcode: info
            .get("pick_code")
            .and_then(Value::as_str)
            .unwrap_or(pickcode)
            .to_string(),
        file_name: info
            .get("file_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        file_size: int_of(info.get("file_size")),
        headers,
    })
}

fn int_of(v: Option<&Value>) -> u64 {
    match v {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

// Session cookies minted by the web endpoint look like
// `<32 hex>=<32 hex>`; anything else in Set-Cookie is ignored.
fn is_download_cookie(value: &str) -> bool {
    let Some((k, v)) = value.split_once('=') else {
        return false;
    };
    k.len() == 32
        && k.bytes().all(|b| b.is_ascii_hexdigit())
        && v.len() >= 32
        && v.bytes().take(32).all(|b| b.is_ascii_hexdigit())
}

/// Negotiates a download URL via the plain web endpoint. Kept for the
/// cookie-bound URLs some integrations expect.
pub async fn download_url_web(client: &Client, pickcode: &str) -> Result<DownloadUrl, Error> {
    let api = format!("{}/files/download", config::get_web_api());
    let resp = client
        .http()
        .get(&api)
        .query(&[("pickcode", pickcode)])
        .send()
        .await?;
    let mut headers = vec![("User-Agent".to_string(), client.user_agent().to_string())];
    for value in resp.headers().get_all("set-cookie") {
        if let Ok(v) = value.to_str() {
            let first = v.split(';').next().unwrap_or("");
            if is_download_cookie(first) {
                headers.push(("Cookie".to_string(), first.to_string()));
                break;
            }
        }
    }
    let body: Value = resp.json().await?;
    if !body.get("state").and_then(Value::as_bool).unwrap_or(false)
        || body.get("pickcode").is_none()
    {
        return Err(Error::NotFound(body));
    }
    let url = body
        .get("file_url")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Ok(DownloadUrl {
        expires_at: expiry_of(&url),
        is_directory: url.is_empty(),
        url,
        file_id: int_of(body.get("file_id")),
        pickcode: body
            .get("pickcode")
            .and_then(Value::as_str)
            .unwrap_or(pickcode)
            .to_string(),
        file_name: body
            .get("file_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        file_size: int_of(body.get("file_size")),
        headers,
    })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{expiry_of, is_download_cookie, parse_app_payload};

    #[test]
    fn test_parse_app_payload_file() {
        let data = json!({
            "12345": {
                "file_name": "a.bin",
                "file_size": "1024",
                "pick_code": "pcabc",
                "url": {"url": "https://cdn.example.com/a.bin?t=1700000300&s=xyz"},
            }
        });
        let got = parse_app_payload(&data, "pcabc", Vec::new()).unwrap();
        assert_eq!(got.file_id, 12345);
        assert_eq!(got.file_size, 1024);
        assert!(!got.is_directory);
        assert_eq!(got.expires_at, Some(1_700_000_300));
    }

    #[test]
    fn test_parse_app_payload_directory() {
        // Directories come back with url: false.
        let data = json!({
            "777": {
                "file_name": "folder",
                "file_size": "",
                "pick_code": "pcdir",
                "url": false,
            }
        });
        let got = parse_app_payload(&data, "pcdir", Vec::new()).unwrap();
        assert!(got.is_directory);
        assert!(got.url.is_empty());
        assert_eq!(got.expires_at, None);
    }

    #[test]
    fn test_parse_app_payload_empty() {
        assert!(parse_app_payload(&json!({}), "pc", Vec::new()).is_err());
    }

    #[test]
    fn test_expiry_parse() {
        assert_eq!(
            expiry_of("https://x.example/o?k=v&t=1699999999"),
            Some(1_699_999_999)
        );
        assert_eq!(expiry_of("https://x.example/o"), None);
        assert_eq!(expiry_of("not a url"), None);
    }

    #[test]
    fn test_download_cookie_shape() {
        let k = "0123456789abcdef0123456789abcdef";
        assert!(is_download_cookie(&format!("{k}={k}")));
        assert!(!is_download_cookie("UID=123"));
        assert!(!is_download_cookie("no-equals-sign"));
    }
}
