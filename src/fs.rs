//! # Filesystem Facade
//!
//! A POSIX-like path namespace over the service's id-addressed object
//! graph: listing, stat, path resolution, mkdir/rename/move/copy/delete
//! and upload, backed by the per-directory attribute cache.
//!
//! Two server quirks shape the semantics here: sibling names are not
//! unique (path resolution is first-match-wins, in listing order), and
//! there is no atomic rename across containers. Callers that need to
//! disambiguate duplicates must address nodes by id.
//!
//! ## Included Submodules
//! - `cache`: attribute cache and path index
//! - `node`: node model and normalization
//! - `path`: escape/join/split conventions

pub mod cache;
pub mod node;
pub mod path;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use serde_json::{json, Value};

use crate::api::download::{self, DownloadUrl};
use crate::api::fs as fs_api;
use crate::api::upload::{self as upload_api, InitOutcome};
use crate::client::Client;
use crate::constants::CACHE_FILL_PAGE_SIZE;
use crate::error::Error;
use crate::fs::cache::{default_version_fn, AttrCache, CacheEntry, VersionFn};
use crate::fs::node::Node;
use crate::fs::path::{file_ext, join_path, split_path};
use crate::oss::UploadCheckpoint;
use crate::upload::engine::{self, UploadOptions, Uploaded};
use crate::upload::source::UploadSource;
use crate::utils::hash;

pub struct FileSystem {
    client: Arc<Client>,
    cache: AttrCache,
}

impl FileSystem {
    pub fn new(client: Arc<Client>) -> Self {
        Self::with_version_fn(client, default_version_fn())
    }

    /// Builds a filesystem whose cache freshness is decided by a custom
    /// predicate over a directory's fresh attributes.
    pub fn with_version_fn(client: Arc<Client>, version_fn: VersionFn) -> Self {
        Self {
            client,
            cache: AttrCache::new(version_fn),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn not_a_directory(id: u64) -> Error {
        Error::NotFound(json!({ "error": "not a directory", "id": id }))
    }

    fn breadcrumb_path(crumbs: &[fs_api::Crumb]) -> String {
        let mut dir = "/".to_string();
        for crumb in crumbs.iter().skip(1) {
            dir = join_path(&dir, &crumb.name);
        }
        dir
    }

    async fn list_page(&self, cid: u64, limit: usize, offset: usize) -> Result<fs_api::DirPage, Error> {
        let page = fs_api::list(&self.client, cid, limit, offset).await?;
        if cid != 0 {
            match page.path.last() {
                Some(last) if last.cid == cid => {}
                _ => return Err(Self::not_a_directory(cid)),
            }
        }
        Ok(page)
    }

    /// One page of a directory listing, uncached. Returns the nodes and
    /// the directory's total child count.
    pub async fn list(
        &self,
        cid: u64,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Node>, u64), Error> {
        let page = self.list_page(cid, limit, offset).await?;
        let dirname = Self::breadcrumb_path(&page.path);
        let mut nodes = Vec::with_capacity(page.data.len());
        for raw in &page.data {
            let mut node = Node::from_raw(raw)?;
            let path = join_path(&dirname, &node.name);
            self.cache.index_path(&path, node.id);
            node.path = Some(path);
            nodes.push(node);
        }
        Ok((nodes, page.count))
    }

    /// A directory's full child list, served from the attribute cache
    /// while the version predicate holds.
    pub async fn read_dir(&self, cid: u64) -> Result<Vec<Node>, Error> {
        let self_attr = self.stat_id(cid).await?;
        if !self_attr.is_directory {
            return Err(Self::not_a_directory(cid));
        }
        let version = self.cache.version_of(&self_attr);
        if let Some(entry) = self.cache.get(cid) {
            if entry.version == version {
                return Ok(entry.ordered().cloned().collect());
            }
        }

        let lock = self.cache.refresh_lock(cid);
        let _guard = lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(entry) = self.cache.get(cid) {
            if entry.version == version {
                return Ok(entry.ordered().cloned().collect());
            }
        }

        let mut children = HashMap::new();
        let mut order = Vec::new();
        let mut offset = 0usize;
        let mut total: Option<u64> = None;
        let mut dirname: Option<String> = None;
        loop {
            let page = self.list_page(cid, CACHE_FILL_PAGE_SIZE, offset).await?;
            match total {
                None => total = Some(page.count),
                // The server does not promise a stable listing; a count
                // change mid-iteration means the snapshot is torn.
                Some(count) if count != page.count => {
                    return Err(Error::Remote(json!({
                        "error": "directory changed during listing",
                        "cid": cid,
                    })));
                }
                _ => {}
            }
            let dirname =
                dirname.get_or_insert_with(|| Self::breadcrumb_path(&page.path));
            for raw in &page.data {
                let mut node = Node::from_raw(raw)?;
                let path = join_path(dirname, &node.name);
                self.cache.index_path(&path, node.id);
                node.path = Some(path);
                order.push(node.id);
                children.insert(node.id, node);
            }
            offset += page.data.len();
            if page.data.is_empty() || offset as u64 >= total.unwrap_or(0) {
                break;
            }
        }
        if let Some(dirname) = &dirname {
            self.cache.index_path(dirname, cid);
        }
        let entry = CacheEntry {
            version,
            self_attr,
            children,
            order,
        };
        let nodes: Vec<Node> = entry.ordered().cloned().collect();
        self.cache.insert(cid, entry);
        Ok(nodes)
    }

    /// A node's attributes by id, with its absolute path derived from
    /// the ancestor breadcrumb.
    pub async fn stat_id(&self, id: u64) -> Result<Node, Error> {
        if id == 0 {
            return Ok(Node::root());
        }
        let resp = fs_api::file_info(&self.client, id).await?;
        let data = resp
            .get("data")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| Error::NotFound(json!({ "id": id })))?;
        let mut node = Node::from_raw(data)?;
        if let Some(crumbs) = data.get("paths").and_then(Value::as_array) {
            let mut dir = "/".to_string();
            for crumb in crumbs {
                let fid = crumb.get("file_id").map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                if fid.as_deref() == Some("0") {
                    continue;
                }
                if let Some(name) = crumb.get("file_name").and_then(Value::as_str) {
                    dir = join_path(&dir, name);
                }
            }
            let path = join_path(&dir, &node.name);
            self.cache.index_path(&path, node.id);
            node.path = Some(path);
        }
        Ok(node)
    }

    /// Resolves an absolute path to an id. With duplicate sibling names
    /// the first match in listing order wins; pass ids to disambiguate.
    pub async fn resolve_path(&self, path: &str) -> Result<u64, Error> {
        if !path.starts_with('/') {
            return Err(Error::InvalidArgument(json!({
                "error": "path must be absolute",
                "path": path,
            })));
        }
        if path == "/" {
            return Ok(0);
        }
        let trimmed = path.trim_end_matches('/');
        if let Some(id) = self.cache.lookup_path(trimmed) {
            return Ok(id);
        }

        let segments = split_path(trimmed);
        // Walk from the deepest cached ancestor rather than the root.
        let mut start = 0usize;
        let mut current = 0u64;
        let mut prefix = String::new();
        for (i, segment) in segments.iter().enumerate() {
            prefix = join_path(
                if prefix.is_empty() { "/" } else { prefix.as_str() },
                segment,
            );
            match self.cache.lookup_path(&prefix) {
                Some(id) => {
                    start = i + 1;
                    current = id;
                }
                None => break,
            }
        }

        for (i, segment) in segments.iter().enumerate().skip(start) {
            let children = self.read_dir(current).await?;
            let found = children
                .iter()
                .find(|n| n.name == *segment)
                .ok_or_else(|| Error::NotFound(json!({ "path": path, "segment": segment })))?;
            if i + 1 < segments.len() && !found.is_directory {
                return Err(Self::not_a_directory(found.id));
            }
            current = found.id;
        }
        Ok(current)
    }

    /// Creates a directory. Duplicate names fail with
    /// [`Error::AlreadyExists`], missing parents with
    /// [`Error::NotFound`].
    pub async fn mkdir(&self, pid: u64, name: &str) -> Result<Node, Error> {
        let resp = fs_api::mkdir(&self.client, pid, name).await?;
        let id = resp
            .get("id")
            .or_else(|| resp.get("cid"))
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .ok_or_else(|| Error::Remote(resp.clone()))?;
        self.cache.invalidate(pid);
        info!(target: "SDK", "created directory {name:?} ({id}) under {pid}");
        self.stat_id(id).await
    }

    /// Renames a node in place. The server refuses to change a file's
    /// extension; with `allow_retype` that case is emulated by a fresh
    /// dedup upload under the new name followed by deleting the old id.
    pub async fn rename(&self, id: u64, new_name: &str, allow_retype: bool) -> Result<Node, Error> {
        let attr = self.stat_id(id).await?;
        if attr.name == new_name {
            return Ok(attr);
        }
        if !attr.is_directory && file_ext(&attr.name) != file_ext(new_name) {
            if !allow_retype {
                return Err(Error::Unsupported(json!({
                    "error": "changing a file extension requires allow_retype",
                    "from": attr.name,
                    "to": new_name,
                })));
            }
            return self.retype_rename(attr, new_name).await;
        }
        fs_api::batch_rename(&self.client, &[(id, new_name.to_string())]).await?;
        self.invalidate_after_mutation(&attr);
        self.stat_id(id).await
    }

    // Re-books the content under the new name via the dedup path, then
    // drops the old id. Content already on the server always instant-hits.
    async fn retype_rename(&self, attr: Node, new_name: &str) -> Result<Node, Error> {
        let sha1 = attr
            .sha1
            .clone()
            .ok_or_else(|| Error::Custom("node has no sha1 to re-book".into()))?;
        let size = attr.size.unwrap_or(0);
        let mut sign_key = String::new();
        let mut sign_val = String::new();
        loop {
            let outcome = upload_api::upload_init(
                &self.client,
                new_name,
                size,
                &sha1,
                attr.parent_id,
                &sign_key,
                &sign_val,
            )
            .await?;
            match outcome {
                InitOutcome::Instant { .. } => break,
                InitOutcome::HashChallenge {
                    sign_key: key,
                    range_start,
                    range_end,
                } if sign_key.is_empty() => {
                    let bytes = self
                        .read_bytes_range(&attr.pickcode, range_start, range_end)
                        .await?;
                    sign_val = hash::sha1_hex_upper(&bytes);
                    sign_key = key;
                }
                _ => {
                    return Err(Error::Remote(json!({
                        "error": "dedup re-book did not instant-hit",
                        "id": attr.id,
                    })));
                }
            }
        }
        fs_api::batch_delete(&self.client, &[attr.id]).await?;
        self.invalidate_after_mutation(&attr);
        self.find_child(attr.parent_id, new_name).await
    }

    async fn find_child(&self, pid: u64, name: &str) -> Result<Node, Error> {
        self.cache.invalidate(pid);
        let children = self.read_dir(pid).await?;
        children
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NotFound(json!({ "parent": pid, "name": name })))
    }

    fn invalidate_after_mutation(&self, attr: &Node) {
        self.cache.invalidate(attr.parent_id);
        if attr.is_directory {
            self.cache.invalidate_subtree(attr.id, attr.path.as_deref());
        } else if let Some(path) = &attr.path {
            self.cache.unindex_path(path);
        }
    }

    /// Moves nodes into another directory. The server refuses when the
    /// destination already holds a same-named entry being moved in.
    pub async fn move_nodes(&self, ids: &[u64], new_pid: u64) -> Result<(), Error> {
        let mut attrs = Vec::with_capacity(ids.len());
        for id in ids {
            attrs.push(self.stat_id(*id).await?);
        }
        fs_api::batch_move(&self.client, ids, new_pid).await?;
        for attr in &attrs {
            self.invalidate_after_mutation(attr);
        }
        self.cache.invalidate(new_pid);
        Ok(())
    }

    /// Copies nodes into another directory, server-side.
    pub async fn copy_nodes(&self, ids: &[u64], new_pid: u64) -> Result<(), Error> {
        fs_api::batch_copy(&self.client, ids, new_pid).await?;
        self.cache.invalidate(new_pid);
        Ok(())
    }

    /// Moves nodes to the recycle bin.
    pub async fn delete(&self, ids: &[u64]) -> Result<(), Error> {
        let mut attrs = Vec::with_capacity(ids.len());
        for id in ids {
            attrs.push(self.stat_id(*id).await?);
        }
        fs_api::batch_delete(&self.client, ids).await?;
        for attr in &attrs {
            self.invalidate_after_mutation(attr);
        }
        Ok(())
    }

    /// Every node under `id`, breadth-first, directories included.
    pub async fn walk(&self, id: u64) -> Result<Vec<Node>, Error> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let children = self.read_dir(current).await?;
            for child in &children {
                if child.is_directory {
                    queue.push_back(child.id);
                }
            }
            out.extend(children);
        }
        Ok(out)
    }

    /// Searches below `cid` for names matching `query`.
    pub async fn search(
        &self,
        cid: u64,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Node>, u64), Error> {
        let page = fs_api::search(&self.client, cid, query, limit, offset).await?;
        let mut nodes = Vec::with_capacity(page.data.len());
        for raw in &page.data {
            nodes.push(Node::from_raw(raw)?);
        }
        Ok((nodes, page.count))
    }

    /// Negotiates a time-limited download URL for a pickcode. The
    /// returned headers must accompany the fetch; refresh within about
    /// five minutes of the inline expiry.
    pub async fn get_download_url(&self, pickcode: &str) -> Result<DownloadUrl, Error> {
        download::download_url_app(&self.client, pickcode).await
    }

    /// Reads an inclusive byte range of a stored file through its
    /// download URL.
    pub async fn read_bytes_range(
        &self,
        pickcode: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, Error> {
        let info = self.get_download_url(pickcode).await?;
        if info.is_directory {
            return Err(Error::InvalidArgument(json!({
                "error": "pickcode names a directory",
                "pickcode": pickcode,
            })));
        }
        let mut req = self
            .client
            .http()
            .get(&info.url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        for (k, v) in &info.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await?.error_for_status()?;
        if resp.status().as_u16() != 206 {
            return Err(Error::Custom("download host ignored the range".into()));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Uploads a source into directory `pid` and returns the booked
    /// node. An interrupted multipart upload surfaces as
    /// [`Error::MultipartAborted`]; resume with [`Self::resume_upload`].
    pub async fn upload(
        &self,
        source: UploadSource,
        pid: u64,
        name: Option<String>,
        opts: UploadOptions,
    ) -> Result<Node, Error> {
        let uploaded = engine::upload(&self.client, source, pid, name, opts).await?;
        self.node_from_uploaded(pid, uploaded).await
    }

    /// Resumes a checkpointed multipart upload with the same source
    /// bytes it was started from.
    pub async fn resume_upload(
        &self,
        checkpoint: &UploadCheckpoint,
        source: UploadSource,
    ) -> Result<Node, Error> {
        let uploaded = engine::resume_upload(&self.client, checkpoint, source).await?;
        if let Some(id) = uploaded.file_id {
            return self.stat_id(id).await;
        }
        Ok(Self::synthesize(0, &uploaded))
    }

    /// Abandons a checkpointed upload on the server.
    pub async fn abort_upload(&self, checkpoint: &UploadCheckpoint) -> Result<(), Error> {
        engine::abort(&self.client, checkpoint).await
    }

    fn synthesize(pid: u64, uploaded: &Uploaded) -> Node {
        Node {
            id: uploaded.file_id.unwrap_or(0),
            parent_id: pid,
            name: uploaded.file_name.clone(),
            is_directory: false,
            size: Some(uploaded.file_size),
            sha1: uploaded.sha1.clone(),
            pickcode: uploaded.pickcode.clone().unwrap_or_default(),
            ..Default::default()
        }
    }

    async fn node_from_uploaded(&self, pid: u64, uploaded: Uploaded) -> Result<Node, Error> {
        self.cache.invalidate(pid);
        if let Some(id) = uploaded.file_id {
            return self.stat_id(id).await;
        }
        // The listing can lag a freshly booked upload; retry once.
        for _ in 0..2 {
            match self.find_child(pid, &uploaded.file_name).await {
                Ok(node) => return Ok(node),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(target: "SDK", "upload booked but not yet listed; synthesizing node");
        Ok(Self::synthesize(pid, &uploaded))
    }
}

#[cfg(test)]
mod test {
    use serde_json::Value;

    use super::{FileSystem, Uploaded};
    use crate::api::fs::Crumb;

    fn crumb(cid: u64, name: &str) -> Crumb {
        Crumb {
            cid,
            pid: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_breadcrumb_path() {
        assert_eq!(FileSystem::breadcrumb_path(&[crumb(0, "")]), "/");
        assert_eq!(
            FileSystem::breadcrumb_path(&[crumb(0, ""), crumb(9, "docs"), crumb(11, "2024")]),
            "/docs/2024"
        );
        // Names containing a slash stay escaped inside one segment.
        assert_eq!(
            FileSystem::breadcrumb_path(&[crumb(0, ""), crumb(9, "a/b")]),
            "/a\\/b"
        );
    }

    #[test]
    fn test_synthesized_node() {
        let uploaded = Uploaded {
            file_name: "clip.mp4".to_string(),
            file_size: 9,
            sha1: Some("AB".to_string()),
            pickcode: Some("pc".to_string()),
            file_id: None,
            raw: Value::Null,
        };
        let node = FileSystem::synthesize(42, &uploaded);
        assert_eq!(node.parent_id, 42);
        assert_eq!(node.name, "clip.mp4");
        assert_eq!(node.size, Some(9));
        assert_eq!(node.pickcode, "pc");
        assert!(!node.is_directory);
    }
}
