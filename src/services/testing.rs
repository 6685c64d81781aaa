//! In-process stand-ins for the storage and delivery endpoints, plus a
//! throwaway ledger and temp directories.

use crate::services::{
    ledger::Ledger,
    messenger::{DeliveryRef, Messenger, MessengerError},
    storage_client::{ByteStream, ListedBucket, ListedObject, ObjectStorage, StorageError, StorageResult},
};
use crate::models::object::ObjectIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use uuid::Uuid;

pub async fn memory_ledger() -> Ledger {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = Ledger::new(Arc::new(pool));
    ledger.migrate().await.unwrap();
    ledger
}

pub fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_milliseconds().abs();
    assert!(drift < 2_000, "{} is not within 2s of {}", actual, expected);
}

/// Directory under the system temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!("bucket-relay-{}-{}", label, Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    /// Every regular file below the directory.
    pub fn files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path, out);
                    } else {
                        out.push(path);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.path, &mut out);
        out
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[derive(Clone)]
struct StoredObject {
    listing: ListedObject,
    body: Vec<u8>,
}

#[derive(Default)]
struct StorageState {
    buckets: BTreeMap<String, Vec<StoredObject>>,
    fail_list_buckets: bool,
    failing_buckets: HashSet<String>,
    failing_downloads: HashSet<String>,
    list_calls: BTreeMap<String, usize>,
}

#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace an object; returns its identity.
    pub fn put(&self, bucket: &str, key: &str, etag: &str, body: Vec<u8>) -> ObjectIdentity {
        let listing = ListedObject {
            key: Some(key.to_string()),
            etag: Some(etag.to_string()),
            size: Some(body.len() as u64),
            last_modified: Some(Utc::now()),
        };
        let identity = listing.clone().into_identity(bucket).unwrap();

        let mut state = self.state.lock().unwrap();
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        objects.retain(|o| o.listing.key.as_deref() != Some(key));
        objects.push(StoredObject { listing, body });
        identity
    }

    pub fn put_listing(&self, bucket: &str, listing: ListedObject) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .push(StoredObject {
                listing,
                body: Vec::new(),
            });
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        if let Some(objects) = self.state.lock().unwrap().buckets.get_mut(bucket) {
            objects.retain(|o| o.listing.key.as_deref() != Some(key));
        }
    }

    pub fn fail_list_buckets(&self, fail: bool) {
        self.state.lock().unwrap().fail_list_buckets = fail;
    }

    pub fn fail_bucket(&self, bucket: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_buckets
            .insert(bucket.to_string());
    }

    pub fn fail_download(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_downloads
            .insert(key.to_string());
    }

    pub fn list_calls(&self, bucket: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .list_calls
            .get(bucket)
            .copied()
            .unwrap_or(0)
    }

    fn find(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .and_then(|objects| {
                objects
                    .iter()
                    .find(|o| o.listing.key.as_deref() == Some(key))
                    .cloned()
            })
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn list_buckets(&self) -> StorageResult<Vec<ListedBucket>> {
        let state = self.state.lock().unwrap();
        if state.fail_list_buckets {
            return Err(StorageError::Transport("list buckets timed out".into()));
        }
        Ok(state
            .buckets
            .keys()
            .map(|name| ListedBucket { name: name.clone() })
            .collect())
    }

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>> {
        let mut state = self.state.lock().unwrap();
        *state.list_calls.entry(bucket.to_string()).or_default() += 1;
        if state.failing_buckets.contains(bucket) {
            return Err(StorageError::Transport(format!("listing {} failed", bucket)));
        }
        Ok(state
            .buckets
            .get(bucket)
            .map(|objects| objects.iter().map(|o| o.listing.clone()).collect())
            .unwrap_or_default())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectIdentity> {
        let stored = self.find(bucket, key)?;
        stored
            .listing
            .into_identity(bucket)
            .ok_or_else(|| StorageError::Malformed("incomplete listing".into()))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        if self.state.lock().unwrap().failing_downloads.contains(key) {
            return Err(StorageError::Transport("connection reset".into()));
        }
        let stored = self.find(bucket, key)?;
        // Deliver in small pieces so callers exercise their streaming path.
        let pieces: Vec<std::io::Result<Bytes>> = stored
            .body
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(pieces)))
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub destination: String,
    pub file_name: String,
    pub caption: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct MessengerState {
    documents: Vec<SentMessage>,
    texts: Vec<String>,
    document_calls: usize,
    failing_calls: HashSet<usize>,
    fail_all: bool,
    panic_on: Option<String>,
    snapshots: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct FakeMessenger {
    state: Mutex<MessengerState>,
}

impl FakeMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the `n`th document send (1-based, counting every call) fail.
    pub fn fail_document_call(&self, n: usize) {
        self.state.lock().unwrap().failing_calls.insert(n);
    }

    pub fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    /// Panic when asked to send a file whose name contains `needle`.
    pub fn panic_on(&self, needle: &str) {
        self.state.lock().unwrap().panic_on = Some(needle.to_string());
    }

    pub fn documents(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().documents.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.state.lock().unwrap().texts.clone()
    }

    /// For each document call, the sorted file names that sat next to the
    /// file being sent at that moment.
    pub fn snapshots(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().snapshots.clone()
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_document(
        &self,
        destination: &str,
        path: &Path,
        caption: &str,
    ) -> Result<DeliveryRef, MessengerError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let mut siblings: Vec<String> = path
            .parent()
            .and_then(|dir| std::fs::read_dir(dir).ok())
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        siblings.sort();

        let (call, should_fail, should_panic) = {
            let mut state = self.state.lock().unwrap();
            state.snapshots.push(siblings);
            state.document_calls += 1;
            let call = state.document_calls;
            let should_panic = state
                .panic_on
                .as_deref()
                .is_some_and(|needle| file_name.contains(needle));
            (call, state.fail_all || state.failing_calls.contains(&call), should_panic)
        };

        if should_panic {
            panic!("delivery client crashed on {}", file_name);
        }
        if should_fail {
            return Err(MessengerError::Transport(format!("send {} timed out", call)));
        }

        let body = tokio::fs::read(path).await?;
        let mut state = self.state.lock().unwrap();
        state.documents.push(SentMessage {
            destination: destination.to_string(),
            file_name,
            caption: caption.to_string(),
            body,
        });
        Ok(DeliveryRef(format!("msg-{}", call)))
    }

    async fn send_text(&self, _destination: &str, text: &str) -> Result<DeliveryRef, MessengerError> {
        let mut state = self.state.lock().unwrap();
        state.texts.push(text.to_string());
        Ok(DeliveryRef(format!("text-{}", state.texts.len())))
    }
}
