//! src/services/storage_client.rs
//!
//! Object-storage collaborator. `ObjectStorage` is the seam the poller,
//! processor and retry sweep depend on; `S3Client` implements it against a
//! path-style S3-compatible endpoint (RustFS, MinIO) with SigV4 signing.

use crate::{
    errors::RelayError,
    models::object::ObjectIdentity,
    services::sigv4::{self, Credentials},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use reqwest::{Method, StatusCode, Url, header};
use serde::Deserialize;
use std::{io, pin::Pin, time::Duration};
use thiserror::Error;
use tracing::debug;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage transport failure: {0}")]
    Transport(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("access denied: {0}")]
    PermissionDenied(String),
    #[error("malformed storage response: {0}")]
    Malformed(String),
    #[error("object key `{0}` cannot be addressed by path")]
    InvalidKey(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => RelayError::NotFound(err.to_string()),
            StorageError::InvalidKey(_) => RelayError::Validation(err.to_string()),
            other => RelayError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedBucket {
    pub name: String,
}

/// One entry of a bucket listing. Fields are optional because listings
/// from third-party endpoints are not always complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedObject {
    pub key: Option<String>,
    pub etag: Option<String>,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ListedObject {
    /// `None` when the entry lacks a key or an etag.
    pub fn into_identity(self, bucket: &str) -> Option<ObjectIdentity> {
        let key = self.key.filter(|k| !k.is_empty())?;
        let etag = self.etag.filter(|e| !e.is_empty())?;
        Some(ObjectIdentity {
            bucket: bucket.to_string(),
            key,
            etag,
            size: self.size.unwrap_or(0),
            last_modified: self.last_modified.unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn list_buckets(&self) -> StorageResult<Vec<ListedBucket>>;

    /// Every object in `bucket`, in listing order.
    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>>;

    /// Current identity of one object.
    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectIdentity>;

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ByteStream>;
}

/// Connection settings for [`S3Client`].
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Bound on list and head calls. Downloads use it as connect/read timeout.
    pub request_timeout: Duration,
}

pub struct S3Client {
    http: reqwest::Client,
    base: Url,
    credentials: Credentials,
    request_timeout: Duration,
}

impl S3Client {
    pub fn new(config: S3Config) -> Result<Self, RelayError> {
        let base = Url::parse(config.endpoint.trim_end_matches('/')).map_err(|err| {
            RelayError::Configuration(format!("invalid storage endpoint `{}`: {}", config.endpoint, err))
        })?;
        if base.host_str().is_none() {
            return Err(RelayError::Configuration(format!(
                "storage endpoint `{}` has no host",
                config.endpoint
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .read_timeout(config.request_timeout)
            .build()
            .map_err(|err| RelayError::Configuration(format!("building storage client: {}", err)))?;

        Ok(Self {
            http,
            base,
            credentials: config.credentials,
            request_timeout: config.request_timeout,
        })
    }

    fn host_header(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Build a signed request for `path` (unencoded, starting with `/`).
    fn signed(&self, method: Method, path: &str, query: &[(&str, &str)]) -> StorageResult<reqwest::RequestBuilder> {
        let canonical_uri = sigv4::uri_encode(path, false);
        let canonical_query = sigv4::canonical_query(query);

        let mut raw = format!(
            "{}://{}{}",
            self.base.scheme(),
            self.host_header(),
            canonical_uri
        );
        if !canonical_query.is_empty() {
            raw.push('?');
            raw.push_str(&canonical_query);
        }
        let url = Url::parse(&raw).map_err(|err| StorageError::Malformed(err.to_string()))?;

        let signed = sigv4::sign(
            &self.credentials,
            method.as_str(),
            &self.host_header(),
            &canonical_uri,
            &canonical_query,
            Utc::now(),
        );

        Ok(self
            .http
            .request(method, url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(header::AUTHORIZATION, signed.authorization))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        bucket: &str,
        key: &str,
    ) -> StorageResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                StorageError::PermissionDenied(format!("{} {}", status, snippet(&body)))
            }
            _ => StorageError::Transport(format!("{} {}", status, snippet(&body))),
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Client {
    async fn list_buckets(&self) -> StorageResult<Vec<ListedBucket>> {
        let request = self.signed(Method::GET, "/", &[])?.timeout(self.request_timeout);
        let body = self
            .send(request, "", "")
            .await?
            .text()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))?;

        parse_bucket_list(&body)
    }

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>> {
        let path = format!("/{}", bucket);
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2")];
            if let Some(t) = token.as_deref() {
                query.push(("continuation-token", t));
            }

            let request = self.signed(Method::GET, &path, &query)?.timeout(self.request_timeout);
            let body = self
                .send(request, bucket, "")
                .await?
                .text()
                .await
                .map_err(|err| StorageError::Transport(err.to_string()))?;

            let page = parse_object_page(&body)?;
            debug!("listed {} objects from {}", page.objects.len(), bucket);
            objects.extend(page.objects);

            match page.next_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectIdentity> {
        let path = object_path(bucket, key)?;
        let request = self.signed(Method::HEAD, &path, &[])?.timeout(self.request_timeout);
        let response = self.send(request, bucket, key).await?;
        let headers = response.headers();

        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Malformed(format!("no ETag for {}/{}", bucket, key)))?;
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(ObjectIdentity {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag,
            size,
            last_modified,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let path = object_path(bucket, key)?;
        let request = self.signed(Method::GET, &path, &[])?;
        let response = self.send(request, bucket, key).await?;

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other))))
    }
}

/// Path-style `/bucket/key`. URL parsing collapses `.` and `..` segments,
/// so keys containing them would be signed for one path and sent to
/// another.
fn object_path(bucket: &str, key: &str) -> StorageResult<String> {
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(format!("/{}/{}", bucket, key))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[derive(Debug, Deserialize)]
struct ListAllMyBucketsResult {
    #[serde(rename = "Buckets", default)]
    buckets: BucketsNode,
}

#[derive(Debug, Default, Deserialize)]
struct BucketsNode {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<BucketNode>,
}

#[derive(Debug, Deserialize)]
struct BucketNode {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ContentsNode>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentsNode {
    #[serde(rename = "Key", default)]
    key: Option<String>,
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
    #[serde(rename = "Size", default)]
    size: Option<u64>,
    #[serde(rename = "LastModified", default)]
    last_modified: Option<String>,
}

struct ObjectPage {
    objects: Vec<ListedObject>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_bucket_list(xml: &str) -> StorageResult<Vec<ListedBucket>> {
    let parsed: ListAllMyBucketsResult =
        quick_xml::de::from_str(xml).map_err(|err| StorageError::Malformed(err.to_string()))?;

    Ok(parsed
        .buckets
        .bucket
        .into_iter()
        .filter(|b| !b.name.is_empty())
        .map(|b| ListedBucket { name: b.name })
        .collect())
}

fn parse_object_page(xml: &str) -> StorageResult<ObjectPage> {
    let parsed: ListBucketResult =
        quick_xml::de::from_str(xml).map_err(|err| StorageError::Malformed(err.to_string()))?;

    let objects = parsed
        .contents
        .into_iter()
        .map(|c| ListedObject {
            key: c.key,
            etag: c.etag,
            size: c.size,
            last_modified: c
                .last_modified
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
        .collect();

    Ok(ObjectPage {
        objects,
        is_truncated: parsed.is_truncated,
        next_token: parsed.next_continuation_token,
    })
}
