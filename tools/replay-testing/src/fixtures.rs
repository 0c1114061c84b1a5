use crate::cache::ContentCache;
use crate::errors::ReplayError;
use crate::store::BlobStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a fixture's input log comes from.
pub trait FixtureSource: Send + Sync {
    /// Human-readable origin, used in logs and diagnostics.
    fn describe(&self) -> String;

    /// File name the acquired log is stored under.
    fn file_name(&self) -> String;

    fn fixture_key(&self) -> String {
        let name = self.file_name();
        Path::new(&name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or(name)
    }

    /// Places the input log inside `destination_dir` and returns its path.
    fn acquire(&self, destination_dir: &Path) -> Result<PathBuf, ReplayError>;
}

#[derive(Debug, Clone)]
pub struct LocalFixture {
    pub path: PathBuf,
}

impl LocalFixture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FixtureSource for LocalFixture {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn acquire(&self, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        let destination = destination_dir.join(self.file_name());
        std::fs::copy(&self.path, &destination).map_err(|e| {
            ReplayError::Io(format!(
                "copy {} -> {}: {e}",
                self.path.display(),
                destination.display()
            ))
        })?;
        Ok(destination)
    }
}

pub struct StoreFixture {
    pub store: Arc<dyn BlobStore>,
    pub key: String,
    pub cache: Arc<ContentCache>,
}

impl StoreFixture {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, cache: Arc<ContentCache>) -> Self {
        Self {
            store,
            key: key.into(),
            cache,
        }
    }
}

impl FixtureSource for StoreFixture {
    fn describe(&self) -> String {
        format!("{}:{}", self.store.store_id(), self.key)
    }

    fn file_name(&self) -> String {
        self.key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.key)
            .to_string()
    }

    fn acquire(&self, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        let destination = destination_dir.join(self.file_name());
        self.cache.fetch(self.store.as_ref(), &self.key, &destination)
    }
}
