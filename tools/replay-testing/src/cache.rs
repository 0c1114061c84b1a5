use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::store::BlobStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const METADATA_SUFFIX: &str = ".meta";

/// Sidecar recorded next to each cached object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub store: String,
    pub key: String,
    pub checksum: Option<String>,
}

/// Local copy of remote fixture blobs, trusted only while the stored
/// integrity tag equals the one the store reports now.
pub struct ContentCache {
    root: PathBuf,
    max_attempts: u32,
    retry_backoff: Duration,
    clock: Arc<dyn Clock>,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            clock,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Refuses store ids and object keys that would resolve outside
    /// `<root>/<store-id>/`. A leading `/` on the key is allowed and ignored.
    pub fn check_key(&self, store_id: &str, key: &str) -> Result<(), ReplayError> {
        let store_ok = matches!(
            Path::new(store_id).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !store_ok {
            return Err(ReplayError::Configuration(format!(
                "store id `{store_id}` is not a plain directory name"
            )));
        }
        let relative = Path::new(key.trim_start_matches('/'));
        let mut normal = 0;
        for component in relative.components() {
            match component {
                Component::Normal(_) => normal += 1,
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ReplayError::Configuration(format!(
                        "object key `{key}` in store `{store_id}` leaves the cache directory"
                    )))
                }
            }
        }
        if normal == 0 {
            return Err(ReplayError::Configuration(format!(
                "object key `{key}` in store `{store_id}` names no object"
            )));
        }
        Ok(())
    }

    pub fn cache_path(&self, store_id: &str, key: &str) -> PathBuf {
        self.root.join(store_id).join(key.trim_start_matches('/'))
    }

    pub fn metadata_path(&self, store_id: &str, key: &str) -> PathBuf {
        let mut path = self.cache_path(store_id, key).into_os_string();
        path.push(METADATA_SUFFIX);
        PathBuf::from(path)
    }

    /// Current fingerprint the store reports for `key`, or `None` when the
    /// store cannot supply one (including when the lookup fails).
    pub fn resolve_integrity_tag(&self, store: &dyn BlobStore, key: &str) -> Option<String> {
        match self.retrying(|| store.head(key)) {
            Ok(meta) => {
                let tag = meta.integrity_tag();
                if tag.is_none() {
                    append_run_log(
                        "warn",
                        "cache.tag.absent",
                        json!({"store": store.store_id(), "key": key}),
                    );
                }
                tag
            }
            Err(err) => {
                append_run_log(
                    "warn",
                    "cache.tag.unavailable",
                    json!({"store": store.store_id(), "key": key, "error": err.to_string()}),
                );
                None
            }
        }
    }

    pub fn is_valid(&self, store_id: &str, key: &str, expected_tag: Option<&str>) -> bool {
        let Some(expected) = expected_tag else {
            return false;
        };
        if self.check_key(store_id, key).is_err() {
            return false;
        }
        if !self.cache_path(store_id, key).is_file() {
            return false;
        }
        let Ok(raw) = std::fs::read_to_string(self.metadata_path(store_id, key)) else {
            return false;
        };
        match serde_json::from_str::<CacheMetadata>(&raw) {
            Ok(meta) => meta.checksum.as_deref() == Some(expected),
            Err(_) => false,
        }
    }

    /// Copies the object to `destination`, downloading into the cache first
    /// unless the cached copy is still valid. The cached file itself is never
    /// handed out.
    pub fn fetch(
        &self,
        store: &dyn BlobStore,
        key: &str,
        destination: &Path,
    ) -> Result<PathBuf, ReplayError> {
        let store_id = store.store_id();
        self.check_key(store_id, key)?;
        let cached = self.cache_path(store_id, key);
        let tag = self.resolve_integrity_tag(store, key);

        if self.is_valid(store_id, key, tag.as_deref()) {
            append_run_log(
                "info",
                "cache.hit",
                json!({"store": store_id, "key": key, "checksum": tag}),
            );
        } else {
            append_run_log(
                "info",
                "cache.miss",
                json!({"store": store_id, "key": key, "checksum": tag}),
            );
            // Surfaces not-found / unauthorized distinctly from a missing tag.
            let meta = self.retrying(|| store.head(key))?;
            self.refresh(store, key, &cached, meta.integrity_tag())?;
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ReplayError::Io(format!("{}: {e}", parent.display())))?;
        }
        std::fs::copy(&cached, destination).map_err(|e| {
            ReplayError::Io(format!(
                "copy {} -> {}: {e}",
                cached.display(),
                destination.display()
            ))
        })?;
        Ok(destination.to_path_buf())
    }

    fn refresh(
        &self,
        store: &dyn BlobStore,
        key: &str,
        cached: &Path,
        tag: Option<String>,
    ) -> Result<(), ReplayError> {
        let parent = cached
            .parent()
            .ok_or_else(|| ReplayError::Io(format!("{} has no parent", cached.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", parent.display())))?;

        let partial = scratch_path(cached);
        let downloaded = self.retrying(|| store.download(key, &partial));
        if let Err(err) = downloaded {
            let _ = std::fs::remove_file(&partial);
            return Err(err);
        }
        rename_into_place(&partial, cached)?;

        let metadata = CacheMetadata {
            store: store.store_id().to_string(),
            key: key.to_string(),
            checksum: tag,
        };
        let rendered = serde_json::to_string_pretty(&metadata)
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        let meta_path = self.metadata_path(store.store_id(), key);
        let meta_partial = scratch_path(&meta_path);
        std::fs::write(&meta_partial, rendered)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", meta_partial.display())))?;
        rename_into_place(&meta_partial, &meta_path)?;

        append_run_log(
            "info",
            "cache.stored",
            json!({
                "store": store.store_id(),
                "key": key,
                "path": cached.display().to_string(),
                "checksum": metadata.checksum,
            }),
        );
        Ok(())
    }

    fn retrying<T>(
        &self,
        mut op: impl FnMut() -> Result<T, ReplayError>,
    ) -> Result<T, ReplayError> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry_backoff * attempt;
                    append_run_log(
                        "warn",
                        "cache.fetch.retry",
                        json!({
                            "attempt": attempt,
                            "max_attempts": self.max_attempts,
                            "delay_ms": delay.as_millis() as u64,
                            "error": err.to_string(),
                        }),
                    );
                    self.clock.sleep_until(self.clock.now() + delay)?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn scratch_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.part", Uuid::new_v4().simple()))
}

fn rename_into_place(from: &Path, to: &Path) -> Result<(), ReplayError> {
    std::fs::rename(from, to).map_err(|e| {
        let _ = std::fs::remove_file(from);
        ReplayError::Io(format!("rename {} -> {}: {e}", from.display(), to.display()))
    })
}
