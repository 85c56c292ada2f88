//! # Storage Request Signing
//!
//! Builds the v1-style `Authorization: OSS <key>:<signature>` header.
//! The string to sign is the request method, content headers, GMT date,
//! canonicalized `x-oss-*` headers and the canonicalized resource;
//! only the closed set of subresource query keys participates in the
//! resource, not the whole query string.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use sha1::Sha1;
use std::collections::HashSet;

use super::StsToken;

const SUBRESOURCE_KEYS: &[&str] = &[
    "response-content-type",
    "response-content-language",
    "response-cache-control",
    "logging",
    "response-content-encoding",
    "acl",
    "uploadId",
    "uploads",
    "partNumber",
    "group",
    "link",
    "delete",
    "website",
    "location",
    "objectInfo",
    "objectMeta",
    "response-expires",
    "response-content-disposition",
    "cors",
    "lifecycle",
    "restore",
    "qos",
    "referer",
    "stat",
    "bucketInfo",
    "append",
    "position",
    "security-token",
    "live",
    "comp",
    "status",
    "vod",
    "startTime",
    "endTime",
    "x-oss-process",
    "symlink",
    "callback",
    "callback-var",
    "tagging",
    "encryption",
    "versions",
    "versioning",
    "versionId",
    "policy",
    "requestPayment",
    "x-oss-traffic-limit",
    "qosInfo",
    "asyncFetch",
    "x-oss-request-payer",
    "sequential",
    "inventory",
    "inventoryId",
    "continuation-token",
    "worm",
    "wormId",
    "wormExtend",
    "replication",
    "replicationLocation",
    "replicationProgress",
    "transferAcceleration",
    "cname",
    "metaQuery",
    "x-oss-ac-source-ip",
    "x-oss-ac-subnet-mask",
    "x-oss-ac-vpc-id",
    "x-oss-ac-forward-allow",
    "resourceGroup",
    "style",
    "styleName",
    "x-oss-async-process",
    "regionList",
];

static SUBRESOURCE_KEY_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| SUBRESOURCE_KEYS.iter().copied().collect());

pub struct SignedHeaders {
    pub date: String,
    pub authorization: String,
}

/// RFC 1123 GMT timestamp for the `Date` header.
pub fn gmt_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn canonicalized_resource(bucket: &str, object: &str, params: &[(String, String)]) -> String {
    let mut query = String::new();
    for (k, v) in params {
        if !SUBRESOURCE_KEY_SET.contains(k.as_str()) {
            continue;
        }
        if !query.is_empty() {
            query.push('&');
        }
        if v.is_empty() {
            query.push_str(k);
        } else {
            query.push_str(&serde_urlencoded::to_string([(k, v)]).unwrap_or_default());
        }
    }
    if query.is_empty() {
        format!("/{bucket}/{object}")
    } else {
        format!("/{bucket}/{object}?{query}")
    }
}

fn canonicalized_headers(headers: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, &str)> = headers
        .iter()
        .filter_map(|(k, v)| {
            let k = k.to_ascii_lowercase();
            k.starts_with("x-oss-").then_some((k, v.as_str()))
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn string_to_sign(
    method: &str,
    bucket: &str,
    object: &str,
    date: &str,
    params: &[(String, String)],
    headers: &[(String, String)],
) -> String {
    format!(
        "{}\n\n\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        date,
        canonicalized_headers(headers),
        canonicalized_resource(bucket, object, params),
    )
}

/// Computes the `Date` and `Authorization` headers for one request.
pub fn sign_request(
    sts: &StsToken,
    method: &str,
    bucket: &str,
    object: &str,
    params: &[(String, String)],
    headers: &[(String, String)],
) -> SignedHeaders {
    let date = gmt_date();
    let data = string_to_sign(method, bucket, object, &date, params, headers);
    let mut mac = Hmac::<Sha1>::new_from_slice(sts.access_key_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    SignedHeaders {
        authorization: format!("OSS {}:{}", sts.access_key_id, signature),
        date,
    }
}

#[cfg(test)]
mod test {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    use super::string_to_sign;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_string() {
        let s = string_to_sign(
            "PUT",
            "b",
            "o",
            "Tue, 27 Mar 2007 21:15:45 GMT",
            &pairs(&[("partNumber", "1"), ("uploadId", "u")]),
            &pairs(&[("x-oss-security-token", "t")]),
        );
        assert_eq!(
            s,
            "PUT\n\n\nTue, 27 Mar 2007 21:15:45 GMT\nx-oss-security-token:t\n/b/o?partNumber=1&uploadId=u"
        );
    }

    #[test]
    fn test_signature_value() {
        let s = string_to_sign(
            "PUT",
            "b",
            "o",
            "Tue, 27 Mar 2007 21:15:45 GMT",
            &pairs(&[("partNumber", "1"), ("uploadId", "u")]),
            &pairs(&[("x-oss-security-token", "t")]),
        );
        let mut mac = Hmac::<Sha1>::new_from_slice(b"secret").unwrap();
        mac.update(s.as_bytes());
        assert_eq!(
            STANDARD.encode(mac.finalize().into_bytes()),
            "o/WCiF9zTpiQB5PsZluVxHhBOzo="
        );
    }

    #[test]
    fn test_non_subresource_params_ignored() {
        let with_extra = string_to_sign(
            "GET",
            "b",
            "o",
            "Tue, 27 Mar 2007 21:15:45 GMT",
            &pairs(&[("uploadId", "u"), ("part-number-marker", "7")]),
            &[],
        );
        let without = string_to_sign(
            "GET",
            "b",
            "o",
            "Tue, 27 Mar 2007 21:15:45 GMT",
            &pairs(&[("uploadId", "u")]),
            &[],
        );
        assert_eq!(with_extra, without);
    }

    #[test]
    fn test_bare_subresource_key() {
        let s = string_to_sign("POST", "b", "o", "d", &pairs(&[("uploads", "")]), &[]);
        assert!(s.ends_with("/b/o?uploads"));
    }

    #[test]
    fn test_header_sorting_and_case() {
        let s = string_to_sign(
            "PUT",
            "b",
            "o",
            "d",
            &[],
            &pairs(&[
                ("X-OSS-Meta-B", "2"),
                ("x-oss-meta-a", "1"),
                ("Content-Length", "9"),
            ]),
        );
        assert_eq!(s, "PUT\n\n\nd\nx-oss-meta-a:1\nx-oss-meta-b:2\n/b/o");
    }
}
