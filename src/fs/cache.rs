//! # Attribute Cache
//!
//! Per-directory listing cache plus the secondary path→id index.
//!
//! A cached listing is served only while the directory's version — a
//! caller-supplied predicate over its fresh attributes, `mtime` by
//! default — matches what was stored. Mutations invalidate the affected
//! parents explicitly; a directory rename or move drops the whole
//! cached subtree and every indexed path under it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::fs::node::Node;

pub type VersionFn = Arc<dyn Fn(&Node) -> Option<i64> + Send + Sync>;

pub fn default_version_fn() -> VersionFn {
    Arc::new(|node: &Node| node.mtime)
}

/// One cached directory listing. `order` keeps the server's listing
/// order so duplicate sibling names resolve first-match-wins.
#[derive(Clone)]
pub struct CacheEntry {
    pub version: Option<i64>,
    pub self_attr: Node,
    pub children: HashMap<u64, Node>,
    pub order: Vec<u64>,
}

impl CacheEntry {
    /// Children in listing order.
    pub fn ordered(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.children.get(id))
    }
}

pub struct AttrCache {
    entries: Mutex<HashMap<u64, Arc<CacheEntry>>>,
    refresh_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    path_index: Mutex<HashMap<String, u64>>,
    version_fn: VersionFn,
}

impl AttrCache {
    pub fn new(version_fn: VersionFn) -> Self {
        let mut path_index = HashMap::new();
        path_index.insert("/".to_string(), 0);
        Self {
            entries: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            path_index: Mutex::new(path_index),
            version_fn,
        }
    }

    pub fn version_of(&self, node: &Node) -> Option<i64> {
        (self.version_fn)(node)
    }

    pub fn get(&self, id: u64) -> Option<Arc<CacheEntry>> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub fn insert(&self, id: u64, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(id, Arc::new(entry));
    }

    /// The per-directory refresh lock; holders may await while listing.
    pub fn refresh_lock(&self, id: u64) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .clone()
    }

    /// Drops a directory's cached listing.
    pub fn invalidate(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    /// Drops a directory's listing and every cached descendant listing,
    /// along with all indexed paths below `path`.
    pub fn invalidate_subtree(&self, id: u64, path: Option<&str>) {
        let mut entries = self.entries.lock().unwrap();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if let Some(entry) = entries.remove(&current) {
                for child in entry.children.values() {
                    if child.is_directory {
                        queue.push(child.id);
                    }
                }
            }
        }
        drop(entries);
        if let Some(path) = path {
            self.purge_paths_under(path);
        }
    }

    pub fn index_path(&self, path: &str, id: u64) {
        self.path_index.lock().unwrap().insert(path.to_string(), id);
    }

    pub fn lookup_path(&self, path: &str) -> Option<u64> {
        self.path_index.lock().unwrap().get(path).copied()
    }

    pub fn unindex_path(&self, path: &str) {
        self.path_index.lock().unwrap().remove(path);
    }

    /// Removes `path` and everything under it from the index.
    pub fn purge_paths_under(&self, path: &str) {
        let mut index = self.path_index.lock().unwrap();
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        index.retain(|p, _| p != path && !p.starts_with(&prefix));
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::{default_version_fn, AttrCache, CacheEntry};
    use crate::fs::node::Node;

    fn node(id: u64, parent: u64, name: &str, dir: bool) -> Node {
        Node {
            id,
            parent_id: parent,
            name: name.to_string(),
            is_directory: dir,
            ..Default::default()
        }
    }

    fn entry_of(self_attr: Node, children: Vec<Node>) -> CacheEntry {
        let order: Vec<u64> = children.iter().map(|n| n.id).collect();
        let children: HashMap<u64, Node> = children.into_iter().map(|n| (n.id, n)).collect();
        CacheEntry {
            version: Some(1),
            self_attr,
            children,
            order,
        }
    }

    #[test]
    fn test_version_fn_default() {
        let cache = AttrCache::new(default_version_fn());
        let mut n = node(1, 0, "d", true);
        assert_eq!(cache.version_of(&n), None);
        n.mtime = Some(123);
        assert_eq!(cache.version_of(&n), Some(123));
    }

    #[test]
    fn test_ordered_children_first_match() {
        // Two siblings may share a name; listing order decides.
        let entry = entry_of(
            node(1, 0, "d", true),
            vec![node(10, 1, "same", false), node(11, 1, "same", false)],
        );
        let first = entry.ordered().find(|n| n.name == "same").unwrap();
        assert_eq!(first.id, 10);
    }

    #[test]
    fn test_subtree_invalidation() {
        let cache = AttrCache::new(default_version_fn());
        // /a (1) contains /a/b (2); /a/b contains a file.
        cache.insert(1, entry_of(node(1, 0, "a", true), vec![node(2, 1, "b", true)]));
        cache.insert(2, entry_of(node(2, 1, "b", true), vec![node(3, 2, "f", false)]));
        cache.index_path("/a", 1);
        cache.index_path("/a/b", 2);
        cache.index_path("/a/b/f", 3);

        cache.invalidate_subtree(1, Some("/a"));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_none());
        assert!(cache.lookup_path("/a").is_none());
        assert!(cache.lookup_path("/a/b/f").is_none());
        // The root index entry stays.
        assert_eq!(cache.lookup_path("/"), Some(0));
    }

    #[test]
    fn test_invalidate_single() {
        let cache = AttrCache::new(default_version_fn());
        cache.insert(5, entry_of(node(5, 0, "x", true), vec![]));
        assert!(cache.get(5).is_some());
        cache.invalidate(5);
        assert!(cache.get(5).is_none());
    }
}
