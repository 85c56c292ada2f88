//! # Service Transport
//!
//! The HTTP client every binding goes through: a shared reqwest client
//! carrying the session cookie jar and default headers, retry handling
//! for idempotent requests, and the lazily fetched per-session state
//! (upload credentials, storage endpoint, STS token).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config;
use crate::constants::{APP_VERSION, CONNECT_TIMEOUT, COOKIE_DOMAIN, MAX_RETRIES, REQUEST_TIMEOUT};
use crate::error::{check_response, Error};
use crate::oss::StsToken;

/// Per-user upload credentials harvested once per session from the
/// upload-info endpoint. Both feed the upload-init signature fields.
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub user_id: u64,
    pub user_key: String,
}

#[derive(Default)]
struct SessionCache {
    upload_info: Option<UploadInfo>,
    upload_endpoint: Option<String>,
    sts: Option<StsToken>,
}

pub struct Client {
    http: reqwest::Client,
    user_agent: String,
    session: Mutex<SessionCache>,
}

impl Client {
    /// Builds a client from a cookie string containing at least the
    /// `UID`, `CID` and `SEID` pairs.
    pub fn new(cookies: &str) -> Result<Self, Error> {
        let user_agent = format!(
            "Mozilla/5.0 AppleWebKit/600 Safari/600 Chrome/124.0.0.0 115disk/{APP_VERSION}"
        );
        let jar = Arc::new(Jar::default());
        let seed_url = Url::parse(&config::get_web_api())
            .map_err(|e| Error::Custom(format!("bad api base: {e}")))?;
        for pair in cookies.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            jar.add_cookie_str(
                &format!("{pair}; Domain={COOKIE_DOMAIN}; Path=/"),
                &seed_url,
            );
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        let http = reqwest::Client::builder()
            .cookie_provider(jar)
            .default_headers(headers)
            .user_agent(&user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            user_agent,
            session: Mutex::new(SessionCache::default()),
        })
    }

    /// Builds a client from the `PAN115_COOKIES` environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let cookies = config::cookies_from_env()
            .ok_or_else(|| Error::Custom("PAN115_COOKIES is not set".into()))?;
        Self::new(&cookies)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// GET returning parsed JSON, retried on connect failures, timeouts
    /// and 5xx responses.
    pub async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value, Error> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.http.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        if attempt < MAX_RETRIES {
                            warn!(target: "SDK", "HTTP {status} from {url}, retrying");
                            backoff(attempt).await;
                            continue;
                        }
                        return Err(Error::Transient(format!("HTTP {status} from {url}")));
                    }
                    return Ok(resp.json::<Value>().await?);
                }
                Err(e) if attempt < MAX_RETRIES && (e.is_connect() || e.is_timeout()) => {
                    warn!(target: "SDK", "transport error on {url}: {e}, retrying");
                    backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// POST of a form body returning parsed JSON. Mutations are never
    /// retried once the server may have seen them.
    pub async fn post_form_json(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<Value, Error> {
        let resp = self.http.post(url).form(form).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {status} from {url}")));
        }
        Ok(resp.json::<Value>().await?)
    }

    /// POST of a prebuilt body, returning the raw response bytes. Used
    /// by the enveloped endpoints that parse outside the JSON layer.
    pub async fn post_bytes(
        &self,
        url: &str,
        params: &[(&str, String)],
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<Vec<u8>, Error> {
        let ct = HeaderValue::from_str(content_type)
            .map_err(|e| Error::Custom(format!("bad content type: {e}")))?;
        let resp = self
            .http
            .request(Method::POST, url)
            .query(params)
            .header(CONTENT_TYPE, ct)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {status} from {url}")));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// The session's upload credentials, fetched once and cached. An
    /// unauthenticated session surfaces as [`Error::AuthRequired`] here.
    pub async fn upload_info(&self) -> Result<UploadInfo, Error> {
        let mut session = self.session.lock().await;
        if let Some(info) = &session.upload_info {
            return Ok(info.clone());
        }
        let url = format!("{}/app/uploadinfo", config::get_pro_api());
        let resp = check_response(self.get_json(&url, &[]).await?)?;
        let user_id = resp
            .get("user_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Custom("uploadinfo: missing user_id".into()))?;
        let user_key = resp
            .get("userkey")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Custom("uploadinfo: missing userkey".into()))?
            .to_string();
        let info = UploadInfo { user_id, user_key };
        debug!(target: "SDK", "session bound to user {user_id}");
        session.upload_info = Some(info.clone());
        Ok(info)
    }

    /// The storage backend's endpoint base, discovered once per session.
    pub async fn upload_endpoint(&self) -> Result<String, Error> {
        let mut session = self.session.lock().await;
        if let Some(endpoint) = &session.upload_endpoint {
            return Ok(endpoint.clone());
        }
        let url = format!("{}/3.0/getuploadinfo.php", config::get_upload_api());
        let resp = check_response(self.get_json(&url, &[]).await?)?;
        let endpoint = resp
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Custom("getuploadinfo: missing endpoint".into()))?
            .to_string();
        session.upload_endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Request URL for one object on the storage backend:
    /// `<scheme>://<bucket>.<endpoint-host>/<object>`.
    pub async fn upload_endpoint_url(&self, bucket: &str, object: &str) -> Result<String, Error> {
        let endpoint = self.upload_endpoint().await?;
        let parsed =
            Url::parse(&endpoint).map_err(|e| Error::Custom(format!("bad endpoint: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Custom("endpoint without host".into()))?;
        Ok(format!("{}://{bucket}.{host}/{object}", parsed.scheme()))
    }

    /// Short-lived STS credentials for direct storage access, cached
    /// until shortly before expiry. The session lock makes concurrent
    /// refreshes single-flight.
    pub async fn upload_sts(&self) -> Result<StsToken, Error> {
        let mut session = self.session.lock().await;
        if let Some(sts) = &session.sts {
            if sts.expiration - Utc::now() > chrono::Duration::seconds(60) {
                return Ok(sts.clone());
            }
        }
        let url = format!("{}/3.0/gettoken.php", config::get_upload_api());
        let resp = self.get_json(&url, &[]).await?;
        let sts: StsToken = serde_json::from_value(resp)?;
        debug!(target: "SDK", "refreshed STS token, expires {}", sts.expiration);
        session.sts = Some(sts.clone());
        Ok(sts)
    }

    /// Drops the cached STS token so the next use re-fetches. Called
    /// when the backend reports the credentials expired.
    pub async fn invalidate_sts(&self) {
        self.session.lock().await.sts = None;
    }
}

async fn backoff(attempt: u8) {
    let millis = (100u64 << attempt.saturating_sub(1).min(7)).min(10_000);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
