use super::{BlobMetadata, BlobStore, ChecksumKind};
use crate::errors::{FetchErrorKind, ReplayError};
use crate::logging::append_run_log;
use crate::types::EnvMap;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object_attributes::GetObjectAttributesOutput;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::types::ObjectAttributes;
use aws_sdk_s3::Client;
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tokio::runtime::Runtime;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Where an S3 store finds its bucket, region and credentials. Each
/// `*_env` names the variable to read; unset names fall back to the
/// standard `AWS_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Declaration {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id_env: Option<String>,
    pub secret_access_key_env: Option<String>,
    pub session_token_env: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl S3Settings {
    pub fn resolve(id: &str, declaration: &S3Declaration, env: &EnvMap) -> Result<Self, ReplayError> {
        let var = |name: &Option<String>, default: &str| -> Option<String> {
            env.get(name.as_deref().unwrap_or(default))
                .filter(|value| !value.trim().is_empty())
                .cloned()
        };

        let bucket = declaration
            .bucket
            .clone()
            .or_else(|| var(&None, "AWS_BUCKET"))
            .ok_or_else(|| {
                ReplayError::Configuration(format!(
                    "stores.{id} needs `bucket` or the AWS_BUCKET variable"
                ))
            })?;
        let region = declaration
            .region
            .clone()
            .or_else(|| var(&None, "AWS_REGION"))
            .or_else(|| var(&None, "AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint_url = declaration
            .endpoint_url
            .clone()
            .or_else(|| var(&None, "AWS_S3_ENDPOINT_URL"));

        let key_var = declaration.access_key_id_env.as_deref().unwrap_or("AWS_ACCESS_KEY_ID");
        let secret_var = declaration
            .secret_access_key_env
            .as_deref()
            .unwrap_or("AWS_SECRET_ACCESS_KEY");
        let (access_key_id, secret_access_key) = match (
            var(&declaration.access_key_id_env, "AWS_ACCESS_KEY_ID"),
            var(&declaration.secret_access_key_env, "AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(key), Some(secret)) => (key, secret),
            (None, None) => {
                return Err(ReplayError::Configuration(format!(
                    "stores.{id} has no credentials: set {key_var} and {secret_var}"
                )))
            }
            (Some(_), None) => {
                return Err(ReplayError::Configuration(format!(
                    "stores.{id}: {key_var} is set but {secret_var} is not"
                )))
            }
            (None, Some(_)) => {
                return Err(ReplayError::Configuration(format!(
                    "stores.{id}: {secret_var} is set but {key_var} is not"
                )))
            }
        };

        Ok(Self {
            bucket,
            region,
            endpoint_url,
            access_key_id,
            secret_access_key,
            session_token: var(&declaration.session_token_env, "AWS_SESSION_TOKEN"),
        })
    }
}

/// S3 (or an S3-compatible service such as MinIO) reached through the AWS
/// SDK. Calls run to completion on a private current-thread runtime.
pub struct S3BlobStore {
    id: String,
    bucket: String,
    client: Client,
    runtime: Runtime,
}

impl S3BlobStore {
    pub fn new(id: &str, settings: S3Settings) -> Result<Self, ReplayError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ReplayError::Configuration(format!("stores.{id}: cannot start runtime: {e}")))?;

        let credentials = Credentials::new(
            settings.access_key_id,
            settings.secret_access_key,
            settings.session_token,
            None,
            "replay-testing",
        );
        let mut config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = settings.endpoint_url {
            config = config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            id: id.to_string(),
            bucket: settings.bucket,
            client: Client::from_conf(config.build()),
            runtime,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn sdk_error<E>(&self, key: &str, err: SdkError<E>) -> ReplayError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
        let status = err.raw_response().map(|r| r.status().as_u16());
        ReplayError::fetch(
            &self.id,
            key,
            classify_s3_error(code.as_deref(), status),
            format!("s3://{}/{key}: {}", self.bucket, DisplayErrorContext(&err)),
        )
    }

    async fn head_fallback(&self, key: &str) -> Result<BlobMetadata, ReplayError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.sdk_error(key, e))?;
        Ok(head_metadata(&output))
    }
}

/// Known error codes first, then the HTTP status (HEAD responses carry no
/// error code at all).
pub fn classify_s3_error(code: Option<&str>, status: Option<u16>) -> FetchErrorKind {
    match code {
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => FetchErrorKind::NotFound,
        Some(
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
            | "InvalidToken",
        ) => FetchErrorKind::Unauthorized,
        _ => match status {
            Some(404) => FetchErrorKind::NotFound,
            Some(401 | 403) => FetchErrorKind::Unauthorized,
            _ => FetchErrorKind::Transient,
        },
    }
}

fn object_size(size: Option<i64>) -> Option<u64> {
    size.and_then(|n| u64::try_from(n).ok())
}

pub fn attributes_metadata(output: &GetObjectAttributesOutput) -> BlobMetadata {
    let mut meta = BlobMetadata {
        size: object_size(output.object_size()),
        etag: output.e_tag().map(str::to_string),
        ..BlobMetadata::default()
    };
    if let Some(checksum) = output.checksum() {
        let reported = [
            (ChecksumKind::Sha256, checksum.checksum_sha256()),
            (ChecksumKind::Sha1, checksum.checksum_sha1()),
            (ChecksumKind::Crc32, checksum.checksum_crc32()),
            (ChecksumKind::Crc32c, checksum.checksum_crc32_c()),
        ];
        meta.checksums.extend(
            reported
                .into_iter()
                .filter_map(|(kind, value)| value.map(|v| (kind, v.to_string()))),
        );
    }
    meta
}

pub fn head_metadata(output: &HeadObjectOutput) -> BlobMetadata {
    BlobMetadata {
        size: object_size(output.content_length()),
        etag: output.e_tag().map(str::to_string),
        ..BlobMetadata::default()
    }
}

impl BlobStore for S3BlobStore {
    fn store_id(&self) -> &str {
        &self.id
    }

    /// Checksums come from GetObjectAttributes; when that call is refused
    /// (older S3-compatible services, narrower policies) the ETag from
    /// HeadObject is used instead.
    fn head(&self, key: &str) -> Result<BlobMetadata, ReplayError> {
        self.runtime.block_on(async {
            let attributes = self
                .client
                .get_object_attributes()
                .bucket(&self.bucket)
                .key(key)
                .object_attributes(ObjectAttributes::Checksum)
                .object_attributes(ObjectAttributes::Etag)
                .object_attributes(ObjectAttributes::ObjectSize)
                .send()
                .await;
            match attributes {
                Ok(output) => Ok(attributes_metadata(&output)),
                Err(err) => {
                    let err = self.sdk_error(key, err);
                    if matches!(err, ReplayError::Fetch { kind: FetchErrorKind::NotFound, .. }) {
                        return Err(err);
                    }
                    append_run_log(
                        "warn",
                        "store.s3.attributes_unavailable",
                        json!({"store": self.id, "key": key, "error": err.to_string()}),
                    );
                    self.head_fallback(key).await
                }
            }
        })
    }

    fn download(&self, key: &str, destination: &Path) -> Result<(), ReplayError> {
        self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| self.sdk_error(key, e))?;
            let mut body = output.body;
            let mut file = File::create(destination)
                .map_err(|e| ReplayError::Io(format!("{}: {e}", destination.display())))?;
            let mut bytes = 0u64;
            while let Some(chunk) = body.try_next().await.map_err(|e| {
                ReplayError::fetch(&self.id, key, FetchErrorKind::Transient, e.to_string())
            })? {
                file.write_all(&chunk)
                    .map_err(|e| ReplayError::Io(format!("{}: {e}", destination.display())))?;
                bytes += chunk.len() as u64;
            }
            append_run_log(
                "debug",
                "store.s3.downloaded",
                json!({"store": self.id, "bucket": self.bucket, "key": key, "bytes": bytes}),
            );
            Ok(())
        })
    }
}
