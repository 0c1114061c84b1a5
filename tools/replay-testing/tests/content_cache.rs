use replay_testing::cache::{CacheMetadata, ContentCache};
use replay_testing::errors::{FetchErrorKind, ReplayError};
use replay_testing::fixtures::{FixtureSource, StoreFixture};
use replay_testing::runtime::FakeClock;
use replay_testing::store::{BlobMetadata, BlobStore, ChecksumKind, DirectoryBlobStore};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// In-memory store that counts downloads and lets tests swap content.
struct CountingStore {
    objects: Mutex<BTreeMap<String, (String, Option<String>)>>,
    downloads: Mutex<usize>,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            downloads: Mutex::new(0),
        }
    }

    fn put(&self, key: &str, body: &str, sha256: Option<&str>) {
        self.objects
            .lock()
            .expect("objects")
            .insert(key.to_string(), (body.to_string(), sha256.map(str::to_string)));
    }

    fn downloads(&self) -> usize {
        *self.downloads.lock().expect("downloads")
    }
}

impl BlobStore for CountingStore {
    fn store_id(&self) -> &str {
        "bags"
    }

    fn head(&self, key: &str) -> Result<BlobMetadata, ReplayError> {
        let objects = self.objects.lock().expect("objects");
        let (body, sha) = objects
            .get(key)
            .ok_or_else(|| ReplayError::fetch("bags", key, FetchErrorKind::NotFound, "no such key"))?;
        let mut meta = BlobMetadata {
            size: Some(body.len() as u64),
            ..BlobMetadata::default()
        };
        if let Some(sha) = sha {
            meta.checksums.insert(ChecksumKind::Sha256, sha.clone());
        }
        Ok(meta)
    }

    fn download(&self, key: &str, destination: &Path) -> Result<(), ReplayError> {
        let body = self
            .objects
            .lock()
            .expect("objects")
            .get(key)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| ReplayError::fetch("bags", key, FetchErrorKind::NotFound, "no such key"))?;
        *self.downloads.lock().expect("downloads") += 1;
        std::fs::write(destination, body).map_err(|e| ReplayError::Io(e.to_string()))
    }
}

fn cache(root: &Path) -> ContentCache {
    ContentCache::new(root, Arc::new(FakeClock::default()))
}

fn read_metadata(cache: &ContentCache, key: &str) -> CacheMetadata {
    let text = std::fs::read_to_string(cache.metadata_path("bags", key)).expect("metadata");
    serde_json::from_str(&text).expect("metadata json")
}

fn leftover_partials(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read cache dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

#[test]
fn unchanged_checksum_downloads_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = CountingStore::new();
    store.put("drives/a.jsonl", "first", Some("aaa"));
    let cache = cache(&temp.path().join("cache"));

    let one = cache
        .fetch(&store, "drives/a.jsonl", &temp.path().join("f1/a.jsonl"))
        .expect("first fetch");
    let two = cache
        .fetch(&store, "drives/a.jsonl", &temp.path().join("f2/a.jsonl"))
        .expect("second fetch");

    assert_eq!(store.downloads(), 1);
    assert_eq!(std::fs::read_to_string(one).expect("one"), "first");
    assert_eq!(std::fs::read_to_string(two).expect("two"), "first");
    assert_eq!(
        read_metadata(&cache, "drives/a.jsonl").checksum.as_deref(),
        Some("ChecksumSHA256:aaa")
    );
}

#[test]
fn changed_checksum_refreshes_entry_and_metadata() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = CountingStore::new();
    store.put("a.jsonl", "old", Some("v1"));
    let cache = cache(&temp.path().join("cache"));
    cache
        .fetch(&store, "a.jsonl", &temp.path().join("f1/a.jsonl"))
        .expect("first fetch");

    store.put("a.jsonl", "new", Some("v2"));
    let dest = cache
        .fetch(&store, "a.jsonl", &temp.path().join("f2/a.jsonl"))
        .expect("second fetch");

    assert_eq!(store.downloads(), 2);
    assert_eq!(std::fs::read_to_string(dest).expect("dest"), "new");
    assert_eq!(
        std::fs::read_to_string(cache.cache_path("bags", "a.jsonl")).expect("cached"),
        "new"
    );
    assert_eq!(
        read_metadata(&cache, "a.jsonl").checksum.as_deref(),
        Some("ChecksumSHA256:v2")
    );
    assert!(leftover_partials(&temp.path().join("cache/bags")).is_empty());
}

#[test]
fn missing_integrity_tag_always_downloads() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = CountingStore::new();
    store.put("a.jsonl", "body", None);
    let cache = cache(&temp.path().join("cache"));

    for dest in ["f1/a.jsonl", "f2/a.jsonl"] {
        cache
            .fetch(&store, "a.jsonl", &temp.path().join(dest))
            .expect("fetch");
    }
    assert_eq!(store.downloads(), 2);
}

#[test]
fn not_found_is_reported_without_creating_an_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = CountingStore::new();
    let cache = cache(&temp.path().join("cache"));

    let err = cache
        .fetch(&store, "absent.jsonl", &temp.path().join("f/absent.jsonl"))
        .expect_err("absent");
    assert!(matches!(
        err,
        ReplayError::Fetch {
            kind: FetchErrorKind::NotFound,
            ..
        }
    ));
    assert!(!cache.cache_path("bags", "absent.jsonl").exists());
    assert!(!cache.metadata_path("bags", "absent.jsonl").exists());
}

#[test]
fn keys_escaping_the_cache_root_are_rejected_before_download() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = CountingStore::new();
    store.put("../../escaped.jsonl", "payload", Some("aaa"));
    let cache = cache(&temp.path().join("a/cache"));

    let err = cache
        .fetch(&store, "../../escaped.jsonl", &temp.path().join("f/escaped.jsonl"))
        .expect_err("escaping key");
    assert!(matches!(err, ReplayError::Configuration(_)));
    assert_eq!(store.downloads(), 0);
    assert!(!temp.path().join("a/escaped.jsonl").exists());
    assert!(!temp.path().join("a/escaped.jsonl.meta").exists());
    assert!(!temp.path().join("f/escaped.jsonl").exists());
}

#[test]
fn store_fixture_acquires_through_a_directory_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bucket = temp.path().join("bucket");
    std::fs::create_dir_all(bucket.join("drives")).expect("mkdir bucket");
    std::fs::write(bucket.join("drives/highway.jsonl"), "payload").expect("write object");

    let direct = DirectoryBlobStore::new("bucket", bucket.clone());
    let store: Arc<dyn BlobStore> = Arc::new(DirectoryBlobStore::new("bucket", bucket));
    let cache = Arc::new(cache(&temp.path().join("cache")));
    let fixture = StoreFixture::new(store, "drives/highway.jsonl", Arc::clone(&cache));

    assert_eq!(fixture.fixture_key(), "highway");
    assert_eq!(fixture.describe(), "bucket:drives/highway.jsonl");
    let acquired = fixture
        .acquire(&temp.path().join("fixture"))
        .expect("acquire");
    assert_eq!(acquired, temp.path().join("fixture/highway.jsonl"));
    assert_eq!(std::fs::read_to_string(acquired).expect("read"), "payload");
    assert!(cache.cache_path("bucket", "drives/highway.jsonl").is_file());
    let tag = cache.resolve_integrity_tag(&direct, "drives/highway.jsonl");
    assert!(tag.is_some());
    assert!(cache.is_valid("bucket", "drives/highway.jsonl", tag.as_deref()));
}
