//! Resource cache concurrency and consistency tests

use davrepo::{
    Acl, BackingStore, CacheConfig, ChangeLogEntry, ContentMeta, KeyLockConfig, LockDepth,
    LockRequest, MemoryStore, Principal, Privilege, Repository, RepositoryConfig,
    RepositoryError, Resource, ResourceCache, StoreError, StoreResult,
};
use davrepo::StaticDirectory;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn alice() -> Principal {
    Principal::user("alice")
}

/// Store whose mutating operations can be switched off one by one
struct FlakyStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    fn new() -> Self {
        FlakyStore {
            inner: MemoryStore::new(alice()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    fn fail(&self, operations: &[&'static str]) {
        self.failing.lock().extend(operations.iter().copied());
    }

    fn heal(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, operation: &str) -> StoreResult<()> {
        if self.failing.lock().contains(operation) {
            Err(StoreError::Backend(format!("{} offline", operation)))
        } else {
            Ok(())
        }
    }
}

impl BackingStore for FlakyStore {
    fn load(&self, uri: &str) -> StoreResult<Option<Resource>> {
        self.inner.load(uri)
    }

    fn load_children(&self, uri: &str) -> StoreResult<Vec<Resource>> {
        self.inner.load_children(uri)
    }

    fn store(&self, resource: &Resource) -> StoreResult<()> {
        self.check("store")?;
        self.inner.store(resource)
    }

    fn delete(&self, resource: &Resource) -> StoreResult<()> {
        self.check("delete")?;
        self.inner.delete(resource)
    }

    fn copy(
        &self,
        resource: &Resource,
        dest: &str,
        copy_acl: bool,
        owner: &Principal,
    ) -> StoreResult<()> {
        self.check("copy")?;
        self.inner.copy(resource, dest, copy_acl, owner)
    }

    fn move_to(&self, resource: &Resource, dest: &str) -> StoreResult<()> {
        self.check("move_to")?;
        self.inner.move_to(resource, dest)
    }

    fn discover_acls(&self, uri: &str) -> StoreResult<Vec<String>> {
        self.inner.discover_acls(uri)
    }

    fn discover_locks(&self, uri: &str) -> StoreResult<Vec<String>> {
        self.inner.discover_locks(uri)
    }

    fn read_content(&self, resource: &Resource) -> StoreResult<Box<dyn Read + Send>> {
        self.inner.read_content(resource)
    }

    fn write_content(
        &self,
        resource: &Resource,
        content: &mut dyn Read,
    ) -> StoreResult<ContentMeta> {
        self.check("write_content")?;
        self.inner.write_content(resource, content)
    }

    fn add_change_log_entry(&self, entry: ChangeLogEntry) -> StoreResult<()> {
        self.inner.add_change_log_entry(entry)
    }
}

fn repository_over<S: BackingStore>(store: Arc<S>, cache: CacheConfig) -> Repository<S> {
    let config = RepositoryConfig {
        cache,
        ..RepositoryConfig::default()
    };
    Repository::new(store, &config, Arc::new(StaticDirectory::new())).unwrap()
}

fn read_all<S: BackingStore>(repo: &Repository<S>, uri: &str) -> String {
    let mut out = String::new();
    repo.read_content(Some(&alice()), uri)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    out
}

/// Store `count` documents directly in the backing store
fn seed(store: &MemoryStore, count: usize) {
    let root_acl = store.load("/").unwrap().unwrap().acl;
    for i in 0..count {
        let doc = Resource::document(
            format!("/doc{}", i),
            alice(),
            Acl::inherit_from(&root_acl, alice()),
        );
        store.store(&doc).unwrap();
    }
}

#[test]
fn test_stampede_single_fetch() {
    let store = Arc::new(MemoryStore::new(alice()).with_latency(Duration::from_millis(50)));
    seed(&store, 1);
    let cache = Arc::new(ResourceCache::new(
        Arc::clone(&store),
        &CacheConfig::default(),
        &KeyLockConfig::default(),
    ));

    let before = store.load_count();
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.load("/doc0").unwrap().uri.clone()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), "/doc0");
    }

    assert_eq!(store.load_count() - before, 1);
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, threads as u64 - 1);
}

#[test]
fn test_fifo_capacity_bound() {
    let store = Arc::new(MemoryStore::new(alice()));
    seed(&store, 8);
    let cache = ResourceCache::new(
        Arc::clone(&store),
        &CacheConfig {
            max_items: 8,
            eviction_ratio: 0.25,
            ..CacheConfig::default()
        },
        &KeyLockConfig::default(),
    );

    cache.load("/").unwrap();
    for i in 0..8 {
        cache.load(&format!("/doc{}", i)).unwrap();
    }

    let stats = cache.stats();
    assert!(stats.len <= 8);
    assert_eq!(stats.capacity, 8);
    assert!(!cache.contains("/"));
    assert!(cache.contains("/doc7"));
}

#[test]
fn test_acl_change_evicts_cached_descendants() {
    let store = Arc::new(MemoryStore::new(alice()));
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_collection(Some(&a), "/a", None).unwrap();
    repo.create_collection(Some(&a), "/a/b", None).unwrap();
    repo.create_document(Some(&a), "/a/b/c", None).unwrap();
    for uri in ["/a", "/a/b", "/a/b/c"] {
        repo.retrieve(Some(&a), uri).unwrap();
    }
    assert!(repo.cache().contains("/a/b/c"));

    let acl = repo
        .get_acl(Some(&a), "/a")
        .unwrap()
        .explicit()
        .grant(Privilege::Read, Principal::All);
    repo.store_acl(Some(&a), "/a", acl).unwrap();

    assert!(!repo.cache().contains("/a/b"));
    assert!(!repo.cache().contains("/a/b/c"));

    let misses = repo.cache().stats().misses;
    let leaf = repo.retrieve(None, "/a/b/c").unwrap();
    assert_eq!(repo.cache().stats().misses, misses + 1);
    assert!(leaf.acl.contains(Privilege::Read, &Principal::All));
}

#[test]
fn test_backing_failure_leaves_cache_intact() {
    let store = Arc::new(FlakyStore::new());
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_document(Some(&a), "/doc", None).unwrap();
    let before = repo.retrieve(Some(&a), "/doc").unwrap();

    store.fail(&["store", "delete"]);
    let result = repo.lock(Some(&a), "/doc", LockRequest::new(LockDepth::Zero));
    assert!(matches!(result, Err(RepositoryError::Store(StoreError::Backend(_)))));

    let acl = before.acl.clone().explicit().grant(Privilege::Read, Principal::All);
    assert!(matches!(
        repo.store_acl(Some(&a), "/doc", acl),
        Err(RepositoryError::Store(_))
    ));
    assert!(repo.delete(Some(&a), "/doc").is_err());

    let after = repo.retrieve(Some(&a), "/doc").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.lock.is_none());

    store.heal();
    assert!(repo
        .lock(Some(&a), "/doc", LockRequest::new(LockDepth::Zero))
        .is_ok());
}

#[test]
fn test_failed_overwrite_keeps_destination() {
    let store = Arc::new(FlakyStore::new());
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_document(Some(&a), "/src", None).unwrap();
    repo.store_content(Some(&a), "/src", &mut Cursor::new(b"source".to_vec()))
        .unwrap();
    repo.create_document(Some(&a), "/dst", None).unwrap();
    let dst = repo
        .store_content(Some(&a), "/dst", &mut Cursor::new(b"keep".to_vec()))
        .unwrap();

    store.fail(&["copy", "delete"]);
    assert!(matches!(
        repo.copy(Some(&a), "/src", "/dst", true),
        Err(RepositoryError::Store(StoreError::Backend(_)))
    ));
    assert_eq!(repo.retrieve(Some(&a), "/dst").unwrap().content, dst.content);
    assert_eq!(read_all(&repo, "/dst"), "keep");

    store.heal();
    repo.copy(Some(&a), "/src", "/dst", true).unwrap();
    assert_eq!(read_all(&repo, "/dst"), "source");
}

#[test]
fn test_failed_move_keeps_both_sides() {
    let store = Arc::new(FlakyStore::new());
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_collection(Some(&a), "/src", None).unwrap();
    repo.create_document(Some(&a), "/src/doc", None).unwrap();
    repo.create_document(Some(&a), "/dst", None).unwrap();
    repo.store_content(Some(&a), "/dst", &mut Cursor::new(b"keep".to_vec()))
        .unwrap();

    store.fail(&["move_to", "copy", "delete"]);
    assert!(matches!(
        repo.move_to(Some(&a), "/src", "/fresh", false),
        Err(RepositoryError::Store(StoreError::Backend(_)))
    ));
    assert!(repo.move_to(Some(&a), "/src", "/dst", true).is_err());

    assert!(repo.retrieve(Some(&a), "/src/doc").is_ok());
    assert!(matches!(
        repo.retrieve(Some(&a), "/fresh"),
        Err(RepositoryError::NotFound(_))
    ));
    assert_eq!(read_all(&repo, "/dst"), "keep");
    let root = repo.retrieve(Some(&a), "/").unwrap();
    assert!(root.children.contains("/src"));
    assert!(!root.children.contains("/fresh"));

    store.heal();
    repo.move_to(Some(&a), "/src", "/dst", true).unwrap();
    assert!(repo.retrieve(Some(&a), "/dst/doc").is_ok());
    assert!(matches!(
        repo.retrieve(Some(&a), "/src"),
        Err(RepositoryError::NotFound(_))
    ));
}

#[test]
fn test_failed_upload_keeps_content_and_meta() {
    let store = Arc::new(FlakyStore::new());
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_document(Some(&a), "/doc", None).unwrap();
    let before = repo
        .store_content(Some(&a), "/doc", &mut Cursor::new(b"first".to_vec()))
        .unwrap();

    store.fail(&["write_content"]);
    assert!(matches!(
        repo.store_content(Some(&a), "/doc", &mut Cursor::new(b"second!".to_vec())),
        Err(RepositoryError::Store(StoreError::Backend(_)))
    ));
    let cached = repo.retrieve(Some(&a), "/doc").unwrap();
    assert!(Arc::ptr_eq(&before, &cached));
    assert_eq!(read_all(&repo, "/doc"), "first");

    // Metadata is persisted by the content write itself
    store.heal();
    store.fail(&["store"]);
    let after = repo
        .store_content(Some(&a), "/doc", &mut Cursor::new(b"second!".to_vec()))
        .unwrap();
    assert_eq!(after.content.length, 7);
    assert_eq!(store.load("/doc").unwrap().unwrap().content, after.content);
    assert_eq!(read_all(&repo, "/doc"), "second!");
}

/// Stream that deletes the target collection on its first read
struct DeletingReader<'a> {
    repo: &'a Repository<MemoryStore>,
    fired: bool,
    payload: Cursor<Vec<u8>>,
}

impl Read for DeletingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.fired {
            self.fired = true;
            // Nothing below /a stays cached, so the delete does not wait on
            // the key held by the upload
            self.repo.cache().clear();
            self.repo.delete(Some(&alice()), "/a").unwrap();
        }
        self.payload.read(buf)
    }
}

#[test]
fn test_upload_racing_delete_leaves_no_content() {
    let store = Arc::new(MemoryStore::new(alice()));
    let repo = repository_over(Arc::clone(&store), CacheConfig::default());
    let a = alice();

    repo.create_collection(Some(&a), "/a", None).unwrap();
    repo.create_document(Some(&a), "/a/doc", None).unwrap();

    let mut reader = DeletingReader {
        repo: &repo,
        fired: false,
        payload: Cursor::new(b"SECRET".to_vec()),
    };
    assert!(matches!(
        repo.store_content(Some(&a), "/a/doc", &mut reader),
        Err(RepositoryError::Store(StoreError::Missing(_)))
    ));

    repo.create_collection(Some(&a), "/a", None).unwrap();
    let doc = repo.create_document(Some(&a), "/a/doc", None).unwrap();
    assert_eq!(doc.content.length, 0);
    assert_eq!(read_all(&repo, "/a/doc"), "");
}

#[test]
fn test_concurrent_creates_keep_listing_consistent() {
    let store = Arc::new(MemoryStore::new(alice()));
    let repo = Arc::new(repository_over(store, CacheConfig::default()));
    let a = alice();
    repo.create_collection(Some(&a), "/shared", None).unwrap();

    let threads = 8;
    let per_thread = 20;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let a = alice();
                for i in 0..per_thread {
                    repo.create_document(Some(&a), &format!("/shared/t{}-{}", t, i), None)
                        .unwrap();
                    // Interleave reads so the parent keeps getting cached
                    repo.list_children(Some(&a), "/shared").unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(
        repo.list_children(Some(&a), "/shared").unwrap().len(),
        threads * per_thread
    );
}

#[test]
fn test_concurrent_deletes_and_reads() {
    let store = Arc::new(MemoryStore::new(alice()));
    let repo = Arc::new(repository_over(store, CacheConfig::default()));
    let a = alice();
    for i in 0..10 {
        repo.create_collection(Some(&a), &format!("/d{}", i), None).unwrap();
        repo.create_document(Some(&a), &format!("/d{}/leaf", i), None)
            .unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let a = alice();
                for round in 0..50 {
                    let uri = format!("/d{}/leaf", round % 10);
                    match repo.retrieve(Some(&a), &uri) {
                        Ok(_) | Err(RepositoryError::NotFound(_)) => {}
                        Err(e) => panic!("unexpected {:?}", e),
                    }
                }
            })
        })
        .collect();

    for i in 0..10 {
        repo.delete(Some(&a), &format!("/d{}", i)).unwrap();
    }
    for h in readers {
        h.join().unwrap();
    }

    // No reader may have resurrected a deleted resource in the cache
    for i in 0..10 {
        assert!(matches!(
            repo.retrieve(Some(&a), &format!("/d{}/leaf", i)),
            Err(RepositoryError::NotFound(_))
        ));
    }
}
