//! # File-Tree Endpoints
//!
//! Bindings for the directory listing and mutation endpoints. These are
//! thin: they shape the payload, issue the request and classify the
//! response, leaving interpretation to the filesystem layer.

use serde::Deserialize;
use serde_json::Value;

use crate::client::Client;
use crate::config;
use crate::error::{check_response, Error};
use crate::fs::node::de_u64;

/// Endpoint paths under the web API base.
pub enum Endpoint {
    Files,
    FileInfo,
    Add,
    BatchRename,
    Move,
    Copy,
    Delete,
    Search,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Files => "/files",
            Endpoint::FileInfo => "/files/get_info",
            Endpoint::Add => "/files/add",
            Endpoint::BatchRename => "/files/batch_rename",
            Endpoint::Move => "/files/move",
            Endpoint::Copy => "/files/copy",
            Endpoint::Delete => "/rb/delete",
            Endpoint::Search => "/files/search",
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}", config::get_web_api(), self.path())
    }
}

/// One entry of the breadcrumb a listing carries alongside its page.
#[derive(Debug, Clone, Deserialize)]
pub struct Crumb {
    #[serde(deserialize_with = "de_u64")]
    pub cid: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub pid: u64,
    pub name: String,
}

/// One page of a directory listing.
#[derive(Debug, Deserialize)]
pub struct DirPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub path: Vec<Crumb>,
    #[serde(default)]
    pub data: Vec<Value>,
}

/// Lists one page of a directory's children, directories included.
pub async fn list(client: &Client, cid: u64, limit: usize, offset: usize) -> Result<DirPage, Error> {
    let params = [
        ("aid", "1".to_string()),
        ("cid", cid.to_string()),
        ("count_folders", "1".to_string()),
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
        ("record_open_time", "1".to_string()),
        ("show_dir", "1".to_string()),
    ];
    let resp = check_response(client.get_json(&Endpoint::Files.url(), &params).await?)?;
    Ok(serde_json::from_value(resp)?)
}

/// Fetches a node's attributes together with its ancestor breadcrumb.
pub async fn file_info(client: &Client, file_id: u64) -> Result<Value, Error> {
    let params = [("file_id", file_id.to_string())];
    check_response(client.get_json(&Endpoint::FileInfo.url(), &params).await?)
}

/// Creates a directory under `pid`. The response carries the new id.
pub async fn mkdir(client: &Client, pid: u64, cname: &str) -> Result<Value, Error> {
    let form = vec![
        ("pid".to_string(), pid.to_string()),
        ("cname".to_string(), cname.to_string()),
    ];
    check_response(client.post_form_json(&Endpoint::Add.url(), &form).await?)
}

/// Renames nodes in batch. The response's `data` maps each id to the
/// name the server actually assigned.
pub async fn batch_rename(client: &Client, renames: &[(u64, String)]) -> Result<Value, Error> {
    if renames.is_empty() {
        return Err(Error::InvalidArgument(Value::String("no op".into())));
    }
    let form: Vec<(String, String)> = renames
        .iter()
        .map(|(fid, name)| (format!("files_new_name[{fid}]"), name.clone()))
        .collect();
    check_response(
        client
            .post_form_json(&Endpoint::BatchRename.url(), &form)
            .await?,
    )
}

fn ids_form(ids: &[u64]) -> Vec<(String, String)> {
    ids.iter()
        .enumerate()
        .map(|(i, fid)| (format!("fid[{i}]"), fid.to_string()))
        .collect()
}

/// Moves nodes into `pid`.
pub async fn batch_move(client: &Client, ids: &[u64], pid: u64) -> Result<Value, Error> {
    if ids.is_empty() {
        return Err(Error::InvalidArgument(Value::String("no op".into())));
    }
    let mut form = ids_form(ids);
    form.push(("pid".to_string(), pid.to_string()));
    check_response(client.post_form_json(&Endpoint::Move.url(), &form).await?)
}

/// Copies nodes into `pid`. Server-side; no content moves.
pub async fn batch_copy(client: &Client, ids: &[u64], pid: u64) -> Result<Value, Error> {
    if ids.is_empty() {
        return Err(Error::InvalidArgument(Value::String("no op".into())));
    }
    let mut form = ids_form(ids);
    form.push(("pid".to_string(), pid.to_string()));
    check_response(client.post_form_json(&Endpoint::Copy.url(), &form).await?)
}

/// Moves nodes to the recycle bin.
pub async fn batch_delete(client: &Client, ids: &[u64]) -> Result<Value, Error> {
    if ids.is_empty() {
        return Err(Error::InvalidArgument(Value::String("no op".into())));
    }
    let form = ids_form(ids);
    check_response(client.post_form_json(&Endpoint::Delete.url(), &form).await?)
}

/// Searches below `cid`. The server caps `limit + offset` around 10k.
pub async fn search(
    client: &Client,
    cid: u64,
    search_value: &str,
    limit: usize,
    offset: usize,
) -> Result<DirPage, Error> {
    let params = [
        ("aid", "1".to_string()),
        ("cid", cid.to_string()),
        ("search_value", search_value.to_string()),
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
        ("format", "json".to_string()),
    ];
    let resp = check_response(client.get_json(&Endpoint::Search.url(), &params).await?)?;
    Ok(serde_json::from_value(resp)?)
}
