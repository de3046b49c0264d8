//! In-memory backing store
//!
//! Keeps resources in a sorted map so that a subtree is one contiguous range.

use super::{BackingStore, ChangeLogEntry, StoreError, StoreResult};
use crate::core::acl::{Acl, Principal};
use crate::core::resource::{ContentMeta, Resource};
use crate::core::uri;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Thread-safe in-memory [`BackingStore`]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Resource>>,
    content: RwLock<HashMap<String, Vec<u8>>>,
    change_log: Mutex<Vec<ChangeLogEntry>>,
    /// Artificial delay applied to every `load`
    latency: Option<Duration>,
    loads: AtomicU64,
}

/// Entries of `nodes` in the subtree of `root` (inclusive), in sorted order
fn subtree<'a>(
    nodes: &'a BTreeMap<String, Resource>,
    root: &'a str,
) -> impl Iterator<Item = &'a Resource> + 'a {
    nodes
        .range(root.to_string()..)
        .take_while(move |(key, _)| key.starts_with(root))
        .filter(move |(key, _)| uri::is_same_or_descendant(key, root))
        .map(|(_, resource)| resource)
}

/// Validate a copy or move target, returning its parent uri
fn check_target<'a>(
    nodes: &BTreeMap<String, Resource>,
    source: &str,
    dest: &'a str,
) -> StoreResult<&'a str> {
    if uri::is_same_or_descendant(dest, source) {
        return Err(StoreError::Backend(format!(
            "cannot place {} inside itself at {}",
            source, dest
        )));
    }
    let dest_parent = uri::parent(dest)
        .ok_or_else(|| StoreError::Backend("cannot replace the root".to_string()))?;
    if !nodes.get(dest_parent).map_or(false, |p| p.is_collection) {
        return Err(StoreError::Missing(dest_parent.to_string()));
    }
    Ok(dest_parent)
}

/// Copies of the subtree of `resource` rebased onto `dest`, paired with their
/// source uris, parents first
fn plan_copies(
    nodes: &BTreeMap<String, Resource>,
    resource: &Resource,
    dest: &str,
    dest_parent: &str,
    copy_acl: bool,
    owner: &Principal,
) -> StoreResult<Vec<(String, Resource)>> {
    let sources: Vec<&Resource> = subtree(nodes, &resource.uri).collect();
    if sources.is_empty() {
        return Err(StoreError::Missing(resource.uri.clone()));
    }

    // Sorted order visits every new parent before its members
    let mut resolved: HashMap<String, Acl> = HashMap::new();
    resolved.insert(
        dest_parent.to_string(),
        MemoryStore::resolved_acl(nodes, dest_parent)?,
    );

    let now = Utc::now();
    let mut copies = Vec::with_capacity(sources.len());
    for source in sources {
        let target = uri::rebase(&source.uri, &resource.uri, dest);
        let target_parent = uri::parent(&target).unwrap_or(uri::ROOT);
        let parent_acl = resolved
            .get(target_parent)
            .ok_or_else(|| StoreError::Missing(target_parent.to_string()))?;

        let copy_owner = if copy_acl {
            source.owner.clone()
        } else {
            owner.clone()
        };
        let acl = if copy_acl && !source.acl.inherited {
            source.acl.clone()
        } else {
            Acl::inherit_from(parent_acl, copy_owner.clone())
        };

        resolved.insert(target.clone(), acl.clone());
        let copy = Resource {
            uri: target,
            owner: copy_owner,
            is_collection: source.is_collection,
            children: source
                .children
                .iter()
                .map(|child| uri::rebase(child, &resource.uri, dest))
                .collect(),
            acl,
            lock: None,
            content: source.content.clone(),
            created: now,
        };
        copies.push((source.uri.clone(), copy));
    }
    Ok(copies)
}

/// Content of every planned copy that has any, keyed by target uri
fn copied_content(
    content: &HashMap<String, Vec<u8>>,
    copies: &[(String, Resource)],
) -> Vec<(String, Vec<u8>)> {
    copies
        .iter()
        .filter_map(|(source, copy)| {
            content
                .get(source)
                .map(|bytes| (copy.uri.clone(), bytes.clone()))
        })
        .collect()
}

/// Remove the subtree of `root` with its content and unlink it from its parent
fn remove_subtree(
    nodes: &mut BTreeMap<String, Resource>,
    content: &mut HashMap<String, Vec<u8>>,
    root: &str,
) -> usize {
    let doomed: Vec<String> = subtree(nodes, root).map(|r| r.uri.clone()).collect();
    for uri in &doomed {
        nodes.remove(uri);
        content.remove(uri);
    }
    if let Some(parent) = uri::parent(root).and_then(|p| nodes.get_mut(p)) {
        parent.children.remove(root);
    }
    doomed.len()
}

fn install(
    nodes: &mut BTreeMap<String, Resource>,
    content: &mut HashMap<String, Vec<u8>>,
    dest_parent: &str,
    dest: &str,
    copies: Vec<(String, Resource)>,
    bytes: Vec<(String, Vec<u8>)>,
) {
    for (_, copy) in copies {
        nodes.insert(copy.uri.clone(), copy);
    }
    content.extend(bytes);
    if let Some(parent) = nodes.get_mut(dest_parent) {
        parent.children.insert(dest.to_string());
    }
}

impl MemoryStore {
    /// Create a store holding only the root collection owned by `root_owner`
    pub fn new(root_owner: Principal) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(uri::ROOT.to_string(), Resource::root(root_owner));
        MemoryStore {
            nodes: RwLock::new(nodes),
            content: RwLock::new(HashMap::new()),
            change_log: Mutex::new(Vec::new()),
            latency: None,
            loads: AtomicU64::new(0),
        }
    }

    /// Delay every `load` by `latency`, simulating a slow store
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `load` calls served so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of stored resources, root included
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.nodes.read().contains_key(uri)
    }

    /// Snapshot of the change log
    pub fn change_log(&self) -> Vec<ChangeLogEntry> {
        self.change_log.lock().clone()
    }

    /// Resolved ACL of a stored resource
    fn resolved_acl(nodes: &BTreeMap<String, Resource>, uri: &str) -> StoreResult<Acl> {
        nodes
            .get(uri)
            .map(|resource| resource.acl.clone())
            .ok_or_else(|| StoreError::Missing(uri.to_string()))
    }
}

impl BackingStore for MemoryStore {
    fn load(&self, uri: &str) -> StoreResult<Option<Resource>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        Ok(self.nodes.read().get(uri).cloned())
    }

    fn load_children(&self, uri: &str) -> StoreResult<Vec<Resource>> {
        let nodes = self.nodes.read();
        let parent = nodes
            .get(uri)
            .ok_or_else(|| StoreError::Missing(uri.to_string()))?;
        Ok(parent
            .children
            .iter()
            .filter_map(|child| nodes.get(child).cloned())
            .collect())
    }

    fn store(&self, resource: &Resource) -> StoreResult<()> {
        let mut nodes = self.nodes.write();

        let children = match nodes.get(&resource.uri) {
            Some(existing) => existing.children.clone(),
            None => {
                let parent_uri = resource
                    .parent_uri()
                    .ok_or_else(|| StoreError::Backend("cannot recreate the root".to_string()))?;
                let parent = nodes
                    .get_mut(parent_uri)
                    .ok_or_else(|| StoreError::Missing(parent_uri.to_string()))?;
                if !parent.is_collection {
                    return Err(StoreError::Backend(format!(
                        "{} is not a collection",
                        parent_uri
                    )));
                }
                parent.children.insert(resource.uri.clone());
                Default::default()
            }
        };

        debug!("Storing {}", resource.uri);
        nodes.insert(resource.uri.clone(), resource.with_children(children));
        Ok(())
    }

    fn delete(&self, resource: &Resource) -> StoreResult<()> {
        let mut nodes = self.nodes.write();
        let mut content = self.content.write();
        if !nodes.contains_key(&resource.uri) {
            return Err(StoreError::Missing(resource.uri.clone()));
        }

        let removed = remove_subtree(&mut nodes, &mut content, &resource.uri);
        debug!("Deleted {} resources below {}", removed, resource.uri);
        Ok(())
    }

    fn copy(
        &self,
        resource: &Resource,
        dest: &str,
        copy_acl: bool,
        owner: &Principal,
    ) -> StoreResult<()> {
        let mut nodes = self.nodes.write();
        let mut content = self.content.write();

        let dest_parent = check_target(&nodes, &resource.uri, dest)?;
        let copies = plan_copies(&nodes, resource, dest, dest_parent, copy_acl, owner)?;
        let bytes = copied_content(&content, &copies);

        if nodes.contains_key(dest) {
            let replaced = remove_subtree(&mut nodes, &mut content, dest);
            debug!("Replacing {} resources below {}", replaced, dest);
        }
        let count = copies.len();
        install(&mut nodes, &mut content, dest_parent, dest, copies, bytes);

        debug!("Copied {} resources from {} to {}", count, resource.uri, dest);
        Ok(())
    }

    fn move_to(&self, resource: &Resource, dest: &str) -> StoreResult<()> {
        let mut nodes = self.nodes.write();
        let mut content = self.content.write();

        let dest_parent = check_target(&nodes, &resource.uri, dest)?;
        let moved = plan_copies(&nodes, resource, dest, dest_parent, true, &resource.owner)?;
        let bytes = copied_content(&content, &moved);

        remove_subtree(&mut nodes, &mut content, &resource.uri);
        if nodes.contains_key(dest) {
            let replaced = remove_subtree(&mut nodes, &mut content, dest);
            debug!("Replacing {} resources below {}", replaced, dest);
        }
        let count = moved.len();
        install(&mut nodes, &mut content, dest_parent, dest, moved, bytes);

        debug!("Moved {} resources from {} to {}", count, resource.uri, dest);
        Ok(())
    }

    fn discover_acls(&self, uri: &str) -> StoreResult<Vec<String>> {
        let nodes = self.nodes.read();
        Ok(subtree(&nodes, uri)
            .filter(|r| !r.acl.inherited)
            .map(|r| r.uri.clone())
            .collect())
    }

    fn discover_locks(&self, uri: &str) -> StoreResult<Vec<String>> {
        let nodes = self.nodes.read();
        Ok(subtree(&nodes, uri)
            .filter(|r| r.lock.is_some())
            .map(|r| r.uri.clone())
            .collect())
    }

    fn read_content(&self, resource: &Resource) -> StoreResult<Box<dyn Read + Send>> {
        let nodes = self.nodes.read();
        if !nodes.contains_key(&resource.uri) {
            return Err(StoreError::Missing(resource.uri.clone()));
        }
        let bytes = self
            .content
            .read()
            .get(&resource.uri)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn write_content(
        &self,
        resource: &Resource,
        content: &mut dyn Read,
    ) -> StoreResult<ContentMeta> {
        // Consume the stream before taking any lock
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;
        let etag = hex::encode(Sha256::digest(&bytes));
        let meta = ContentMeta {
            length: bytes.len() as u64,
            etag: Some(etag),
            last_modified: Utc::now(),
        };

        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&resource.uri)
            .ok_or_else(|| StoreError::Missing(resource.uri.clone()))?;
        node.content = meta.clone();
        self.content.write().insert(resource.uri.clone(), bytes);
        Ok(meta)
    }

    fn add_change_log_entry(&self, entry: ChangeLogEntry) -> StoreResult<()> {
        self.change_log.lock().push(entry);
        Ok(())
    }
}
