use super::{BlobMetadata, BlobStore, ChecksumKind};
use crate::errors::{FetchErrorKind, ReplayError};
use crate::logging::append_run_log;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, ETAG};
use reqwest::StatusCode;
use serde_json::json;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Response headers that carry an object checksum, in lookup order.
const CHECKSUM_HEADERS: [(&str, ChecksumKind); 6] = [
    ("x-amz-checksum-sha256", ChecksumKind::Sha256),
    ("x-checksum-sha256", ChecksumKind::Sha256),
    ("x-amz-checksum-sha1", ChecksumKind::Sha1),
    ("x-checksum-sha1", ChecksumKind::Sha1),
    ("x-amz-checksum-crc32", ChecksumKind::Crc32),
    ("x-amz-checksum-crc32c", ChecksumKind::Crc32c),
];

#[derive(Clone, PartialEq, Eq)]
pub struct HttpCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for HttpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Artifact repository reached over HTTP(S), optionally with basic auth.
pub struct HttpBlobStore {
    id: String,
    base_url: String,
    credentials: Option<HttpCredentials>,
    client: Client,
}

impl HttpBlobStore {
    pub fn new(
        id: &str,
        base_url: &str,
        credentials: Option<HttpCredentials>,
        timeout: Duration,
    ) -> Result<Self, ReplayError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ReplayError::Configuration(format!("stores.{id}: cannot build HTTP client: {e}"))
        })?;
        Ok(Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            client,
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            None => request,
        }
    }

    /// Sends the request and turns transport failures and non-2xx statuses
    /// into fetch errors.
    fn send(&self, key: &str, request: RequestBuilder) -> Result<Response, ReplayError> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|e| ReplayError::fetch(&self.id, key, FetchErrorKind::Transient, e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(ReplayError::fetch(
            &self.id,
            key,
            status_kind(status),
            format!("HTTP status {status}"),
        ))
    }
}

pub fn status_kind(status: StatusCode) -> FetchErrorKind {
    match status {
        StatusCode::NOT_FOUND => FetchErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchErrorKind::Unauthorized,
        _ => FetchErrorKind::Transient,
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn metadata_from_headers(headers: &HeaderMap) -> BlobMetadata {
    let mut meta = BlobMetadata {
        size: header_text(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
        etag: header_text(headers, ETAG.as_str()),
        ..BlobMetadata::default()
    };
    for (name, kind) in CHECKSUM_HEADERS {
        if let Some(value) = header_text(headers, name) {
            meta.checksums.entry(kind).or_insert(value);
        }
    }
    meta
}

impl BlobStore for HttpBlobStore {
    fn store_id(&self) -> &str {
        &self.id
    }

    fn head(&self, key: &str) -> Result<BlobMetadata, ReplayError> {
        let url = self.object_url(key);
        let response = self.send(key, self.client.head(&url))?;
        append_run_log(
            "debug",
            "store.http.head",
            json!({"store": self.id, "url": url, "status": response.status().as_u16()}),
        );
        Ok(metadata_from_headers(response.headers()))
    }

    fn download(&self, key: &str, destination: &Path) -> Result<(), ReplayError> {
        let url = self.object_url(key);
        let mut response = self.send(key, self.client.get(&url))?;
        let mut file = File::create(destination)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", destination.display())))?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| ReplayError::fetch(&self.id, key, FetchErrorKind::Transient, e.to_string()))?;
        append_run_log(
            "debug",
            "store.http.downloaded",
            json!({"store": self.id, "url": url, "bytes": bytes}),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Answers one connection per canned response on a loopback port and
    /// hands back the raw request heads it saw.
    fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = stream.read(&mut buf).expect("read");
                    if read == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..read]);
                }
                seen.push(String::from_utf8_lossy(&head).to_string());
                stream.write_all(response.as_bytes()).expect("write");
            }
            seen
        });
        (base, handle)
    }

    fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut text = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-length")) {
            text.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        text.push_str("\r\n");
        text.push_str(body);
        text
    }

    fn store(base: &str, credentials: Option<HttpCredentials>) -> HttpBlobStore {
        HttpBlobStore::new("nexus", &format!("{base}/repository/bags/"), credentials, Duration::from_secs(5))
            .expect("store")
    }

    #[test]
    fn head_reads_size_etag_and_strongest_checksum() {
        let (base, server) = serve(vec![response(
            "200 OK",
            &[
                ("Content-Length", "42"),
                ("ETag", "\"v1\""),
                ("X-Checksum-Sha1", "deadbeef"),
            ],
            "",
        )]);
        let meta = store(&base, None).head("sessions/a.jsonl").expect("head");
        assert_eq!(meta.size, Some(42));
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
        assert_eq!(meta.integrity_tag().as_deref(), Some("ChecksumSHA1:deadbeef"));

        let requests = server.join().expect("server");
        assert!(requests[0].starts_with("HEAD /repository/bags/sessions/a.jsonl HTTP/1.1"));
    }

    #[test]
    fn status_codes_map_to_fetch_kinds() {
        for (status, kind) in [
            ("404 Not Found", FetchErrorKind::NotFound),
            ("403 Forbidden", FetchErrorKind::Unauthorized),
            ("401 Unauthorized", FetchErrorKind::Unauthorized),
            ("503 Service Unavailable", FetchErrorKind::Transient),
        ] {
            let (base, server) = serve(vec![response(status, &[], "")]);
            let err = store(&base, None).head("a.jsonl").expect_err("status error");
            match err {
                ReplayError::Fetch { kind: got, .. } => assert_eq!(got, kind, "{status}"),
                other => panic!("unexpected error {other}"),
            }
            server.join().expect("server");
        }
    }

    #[test]
    fn connection_failure_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);
        let err = store(&base, None).head("a.jsonl").expect_err("refused");
        assert!(err.is_retryable());
    }

    #[test]
    fn download_sends_basic_auth_header_and_writes_body() {
        let (base, server) = serve(vec![response("200 OK", &[], "payload")]);
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("a.jsonl");
        let credentials = HttpCredentials {
            username: "robot".to_string(),
            password: "pw".to_string(),
        };
        store(&base, Some(credentials))
            .download("/sessions/a.jsonl", &dest)
            .expect("download");

        assert_eq!(std::fs::read_to_string(&dest).expect("read"), "payload");
        let requests = server.join().expect("server");
        let request = requests[0].to_ascii_lowercase();
        assert!(request.starts_with("get /repository/bags/sessions/a.jsonl http/1.1"));
        assert!(request.contains("authorization: basic cm9ib3q6chc="));
    }

    #[test]
    fn download_not_found_is_distinct() {
        let (base, server) = serve(vec![response("404 Not Found", &[], "")]);
        let dir = tempfile::tempdir().expect("tempdir");
        let err = store(&base, None)
            .download("a.jsonl", &dir.path().join("a.jsonl"))
            .expect_err("404");
        assert!(matches!(
            err,
            ReplayError::Fetch {
                kind: FetchErrorKind::NotFound,
                ..
            }
        ));
        assert!(!err.is_retryable());
        server.join().expect("server");
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let credentials = HttpCredentials {
            username: "robot".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("robot"));
        assert!(!rendered.contains("hunter2"));
    }
}
