//! Remote blob stores that fixtures are fetched from.

mod directory;
mod http;
mod s3;

pub use directory::DirectoryBlobStore;
pub use http::{
    metadata_from_headers, status_kind, HttpBlobStore, HttpCredentials, DEFAULT_HTTP_TIMEOUT_SECS,
};
pub use s3::{classify_s3_error, S3BlobStore, S3Declaration, S3Settings};

use crate::config::StoreDeclaration;
use crate::errors::ReplayError;
use crate::types::EnvMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChecksumKind {
    Sha256,
    Sha1,
    Crc32,
    Crc32c,
}

impl ChecksumKind {
    /// Strongest first.
    pub const PREFERENCE: [ChecksumKind; 4] = [Self::Sha256, Self::Sha1, Self::Crc32, Self::Crc32c];

    pub fn label(self) -> &'static str {
        match self {
            Self::Sha256 => "ChecksumSHA256",
            Self::Sha1 => "ChecksumSHA1",
            Self::Crc32 => "ChecksumCRC32",
            Self::Crc32c => "ChecksumCRC32C",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobMetadata {
    pub size: Option<u64>,
    pub checksums: BTreeMap<ChecksumKind, String>,
    pub etag: Option<String>,
}

impl BlobMetadata {
    /// Strongest available fingerprint rendered as `<Kind>:<value>`, falling
    /// back to the entity tag. `None` when the store offers neither.
    pub fn integrity_tag(&self) -> Option<String> {
        ChecksumKind::PREFERENCE
            .iter()
            .find_map(|kind| {
                self.checksums
                    .get(kind)
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| format!("{}:{value}", kind.label()))
            })
            .or_else(|| {
                self.etag
                    .as_ref()
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| format!("ETag:{value}"))
            })
    }
}

pub trait BlobStore: Send + Sync {
    fn store_id(&self) -> &str;
    fn head(&self, key: &str) -> Result<BlobMetadata, ReplayError>;
    fn download(&self, key: &str, destination: &Path) -> Result<(), ReplayError>;
}

pub type StoreRegistry = BTreeMap<String, Arc<dyn BlobStore>>;

pub fn build_store(
    id: &str,
    declaration: &StoreDeclaration,
    env: &EnvMap,
) -> Result<Arc<dyn BlobStore>, ReplayError> {
    match declaration {
        StoreDeclaration::Directory { root } => {
            Ok(Arc::new(DirectoryBlobStore::new(id, root.clone())))
        }
        StoreDeclaration::Http {
            base_url,
            username_env,
            password_env,
            timeout_secs,
        } => {
            let credentials = match (username_env, password_env) {
                (None, None) => None,
                (Some(user_var), Some(pass_var)) => Some(HttpCredentials {
                    username: lookup_credential(id, env, user_var)?,
                    password: lookup_credential(id, env, pass_var)?,
                }),
                _ => {
                    return Err(ReplayError::Configuration(format!(
                        "stores.{id} must set both username_env and password_env or neither"
                    )))
                }
            };
            let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS));
            Ok(Arc::new(HttpBlobStore::new(id, base_url, credentials, timeout)?))
        }
        StoreDeclaration::S3 {
            bucket,
            region,
            endpoint_url,
            access_key_id_env,
            secret_access_key_env,
            session_token_env,
        } => {
            let declaration = S3Declaration {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint_url: endpoint_url.clone(),
                access_key_id_env: access_key_id_env.clone(),
                secret_access_key_env: secret_access_key_env.clone(),
                session_token_env: session_token_env.clone(),
            };
            let settings = S3Settings::resolve(id, &declaration, env)?;
            Ok(Arc::new(S3BlobStore::new(id, settings)?))
        }
    }
}

pub fn build_registry(
    declarations: &BTreeMap<String, StoreDeclaration>,
    env: &EnvMap,
) -> Result<StoreRegistry, ReplayError> {
    declarations
        .iter()
        .map(|(id, declaration)| build_store(id, declaration, env).map(|store| (id.clone(), store)))
        .collect()
}

fn lookup_credential(store: &str, env: &EnvMap, var: &str) -> Result<String, ReplayError> {
    env.get(var).cloned().ok_or_else(|| {
        ReplayError::Configuration(format!(
            "stores.{store} credential variable `{var}` is not set"
        ))
    })
}
