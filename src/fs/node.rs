//! # Node Model
//!
//! The service addresses everything by 64-bit id and reports listing
//! entries with terse keys (`n`, `s`, `sha`, `pc`, `te`, ...). This
//! module normalizes those into the [`Node`] shape the rest of the SDK
//! works with. File entries carry `fid` + `cid` (parent); directory
//! entries carry `cid` + `pid` (parent).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Deserializes an id the server may send as a number or a string.
pub(crate) fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    value_u64(&v).ok_or_else(|| serde::de::Error::custom(format!("not an id: {v}")))
}

fn value_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => !s.is_empty() && s != "0",
        _ => false,
    }
}

/// A file or directory in the remote tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub parent_id: u64,
    pub name: String,
    pub is_directory: bool,
    /// Bytes; absent for directories.
    pub size: Option<u64>,
    /// Uppercase hex, files only.
    pub sha1: Option<String>,
    /// Opaque content token; may be empty for directories.
    pub pickcode: String,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
    pub atime: Option<i64>,
    // The server's own timestamp variants, kept verbatim alongside the
    // POSIX-style trio above.
    pub utime: Option<i64>,
    pub ptime: Option<i64>,
    pub open_time: Option<i64>,
    pub star: bool,
    pub hidden: bool,
    pub described: bool,
    pub violated: bool,
    pub score: Option<i64>,
    pub labels: Option<Value>,
    pub thumb: Option<String>,
    pub play_long: Option<Value>,
    /// Derived absolute path, when the lister knew it.
    pub path: Option<String>,
}

impl Node {
    /// The synthetic root: id 0, its own parent, empty name.
    pub fn root() -> Self {
        Node {
            id: 0,
            parent_id: 0,
            name: String::new(),
            is_directory: true,
            path: Some("/".to_string()),
            ..Default::default()
        }
    }

    /// Normalizes one raw listing entry.
    pub fn from_raw(info: &Value) -> Result<Self, Error> {
        let (id, parent_id, is_directory) = if info.get("fid").is_some() {
            (
                info.get("fid").and_then(value_u64),
                info.get("cid").and_then(value_u64),
                false,
            )
        } else {
            (
                info.get("cid").and_then(value_u64),
                info.get("pid").and_then(value_u64),
                true,
            )
        };
        let id = id.ok_or_else(|| Error::Custom(format!("entry without id: {info}")))?;
        let parent_id =
            parent_id.ok_or_else(|| Error::Custom(format!("entry without parent: {info}")))?;
        let name = info
            .get("n")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Custom(format!("entry without name: {info}")))?
            .to_string();

        let mtime = info.get("te").and_then(value_i64);
        let utime = info.get("tu").and_then(value_i64);
        let ptime = info.get("tp").and_then(value_i64);
        let open_time = info.get("to").and_then(value_i64);

        Ok(Node {
            id,
            parent_id,
            name,
            is_directory,
            size: info.get("s").and_then(value_u64),
            sha1: info
                .get("sha")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase),
            pickcode: info
                .get("pc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            mtime,
            ctime: ptime,
            atime: open_time,
            utime,
            ptime,
            open_time,
            star: truthy(info.get("m")),
            hidden: truthy(info.get("hdf")),
            described: truthy(info.get("fdes")),
            violated: truthy(info.get("c")),
            score: info.get("score").and_then(value_i64),
            labels: info.get("fl").cloned(),
            thumb: info.get("u").and_then(Value::as_str).map(str::to_string),
            play_long: info.get("play_long").cloned(),
            path: None,
        })
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::Node;

    #[test]
    fn test_file_entry() {
        let raw = json!({
            "fid": "2593093001609739968",
            "cid": "2580587204111760961",
            "n": "report.pdf",
            "s": 10240,
            "sha": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            "pc": "pcabc123",
            "te": "1700000000",
            "tp": "1690000000",
            "to": 1710000000,
            "m": 1,
            "hdf": 0,
        });
        let node = Node::from_raw(&raw).unwrap();
        assert_eq!(node.id, 2593093001609739968);
        assert_eq!(node.parent_id, 2580587204111760961);
        assert!(!node.is_directory);
        assert_eq!(node.size, Some(10240));
        // Hashes normalize to uppercase.
        assert_eq!(
            node.sha1.as_deref(),
            Some("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709")
        );
        assert_eq!(node.mtime, Some(1700000000));
        assert_eq!(node.ctime, Some(1690000000));
        assert_eq!(node.atime, Some(1710000000));
        assert_eq!(node.ptime, node.ctime);
        assert!(node.star);
        assert!(!node.hidden);
    }

    #[test]
    fn test_directory_entry() {
        let raw = json!({
            "cid": "77",
            "pid": "0",
            "n": "photos",
            "pc": "",
        });
        let node = Node::from_raw(&raw).unwrap();
        assert_eq!(node.id, 77);
        assert_eq!(node.parent_id, 0);
        assert!(node.is_directory);
        assert!(node.size.is_none());
        assert!(node.sha1.is_none());
    }

    #[test]
    fn test_rejects_nameless_entry() {
        assert!(Node::from_raw(&json!({"fid": 1, "cid": 2})).is_err());
    }

    #[test]
    fn test_root() {
        let root = Node::root();
        assert_eq!(root.id, 0);
        assert_eq!(root.parent_id, 0);
        assert!(root.is_directory);
        assert_eq!(root.path.as_deref(), Some("/"));
    }
}
