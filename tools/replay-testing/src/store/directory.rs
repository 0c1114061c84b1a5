use super::{BlobMetadata, BlobStore, ChecksumKind};
use crate::errors::{FetchErrorKind, ReplayError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// A directory tree (typically a shared mount) served as a blob store.
/// Object keys are relative paths below `root`.
pub struct DirectoryBlobStore {
    id: String,
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(id: &str, root: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            root,
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ReplayError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ReplayError::fetch(
                &self.id,
                key,
                FetchErrorKind::NotFound,
                "object keys must be relative paths inside the store",
            ));
        }
        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(ReplayError::fetch(
                &self.id,
                key,
                FetchErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        Ok(path)
    }

    fn io_error(&self, key: &str, err: std::io::Error) -> ReplayError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => FetchErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => FetchErrorKind::Unauthorized,
            _ => FetchErrorKind::Transient,
        };
        ReplayError::fetch(&self.id, key, kind, err.to_string())
    }
}

impl BlobStore for DirectoryBlobStore {
    fn store_id(&self) -> &str {
        &self.id
    }

    fn head(&self, key: &str) -> Result<BlobMetadata, ReplayError> {
        let path = self.object_path(key)?;
        let mut file = File::open(&path).map_err(|e| self.io_error(key, e))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let read = file.read(&mut buf).map_err(|e| self.io_error(key, e))?;
            if read == 0 {
                break;
            }
            size += read as u64;
            hasher.update(&buf[..read]);
        }
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        let mut meta = BlobMetadata {
            size: Some(size),
            ..BlobMetadata::default()
        };
        meta.checksums.insert(ChecksumKind::Sha256, digest);
        Ok(meta)
    }

    fn download(&self, key: &str, destination: &Path) -> Result<(), ReplayError> {
        let path = self.object_path(key)?;
        std::fs::copy(&path, destination)
            .map(|_| ())
            .map_err(|e| self.io_error(key, e))
    }
}
