//! src/services/processor.rs
//!
//! FileProcessor delivers one discovered object: fetch into staging,
//! decide whether to split, send through the rate limiter, commit the sent
//! record, clean up. Any failure lands the object in the retry queue.
//!
//! Each call stages into its own directory. Chunk files are removed as soon
//! as their own send is confirmed; the directory (staged copy plus any
//! unsent chunks) is removed when the call ends, success or failure.

use crate::{
    errors::{RelayError, RelayResult},
    models::{log_entry::LogLevel, object::ObjectIdentity},
    services::{
        captions,
        chunker::Chunker,
        ledger::Ledger,
        messenger::Messenger,
        rate_limiter::RateLimiter,
        retry_scheduler::RetryScheduler,
        storage_client::ObjectStorage,
    },
};
use futures::StreamExt;
use serde_json::json;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Chat/channel the delivery endpoint posts into.
    pub destination: String,
    /// Root for per-object staging directories.
    pub staging_dir: PathBuf,
    /// Compare the download against plain-MD5 etags.
    pub verify_etag: bool,
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub chunk_count: u32,
    pub delivery_refs: Vec<String>,
}

pub struct FileProcessor {
    storage: Arc<dyn ObjectStorage>,
    messenger: Arc<dyn Messenger>,
    ledger: Ledger,
    retries: RetryScheduler,
    chunker: Chunker,
    limiter: Arc<RateLimiter>,
    settings: ProcessorSettings,
}

impl FileProcessor {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        messenger: Arc<dyn Messenger>,
        ledger: Ledger,
        retries: RetryScheduler,
        chunker: Chunker,
        limiter: Arc<RateLimiter>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            storage,
            messenger,
            ledger,
            retries,
            chunker,
            limiter,
            settings,
        }
    }

    /// Deliver `identity` and record it as sent.
    ///
    /// Does not consult the ledger first; callers filter already-sent
    /// identities. On a retryable failure the retry entry for
    /// `(bucket, key)` is created or bumped before the error is returned.
    pub async fn process_file(&self, identity: &ObjectIdentity) -> RelayResult<Delivery> {
        if identity.bucket.is_empty() || identity.key.is_empty() || identity.etag.is_empty() {
            return Err(RelayError::validation(
                "invalid file info: bucket, key, and etag are required",
            ));
        }

        info!("Processing: {} ({})", identity, captions::format_bytes(identity.size));

        let staging = self.settings.staging_dir.join(Uuid::new_v4().to_string());
        let result = self.deliver(identity, &staging).await;
        remove_dir_best_effort(&staging).await;

        match result {
            Ok(delivery) => {
                info!(
                    "File processed successfully: {} ({} message(s))",
                    identity, delivery.chunk_count
                );
                self.audit(
                    LogLevel::Info,
                    format!("Delivered {}", identity),
                    json!({
                        "bucket": identity.bucket,
                        "key": identity.key,
                        "etag": identity.etag,
                        "chunks": delivery.chunk_count,
                        "refs": delivery.delivery_refs,
                    }),
                )
                .await;
                Ok(delivery)
            }
            Err(err) => {
                error!("Processing failed: {}: {}", identity, err);
                if err.is_retryable() {
                    if let Err(queue_err) = self
                        .retries
                        .record_failure(&identity.bucket, &identity.key, identity.size, &err.to_string())
                        .await
                    {
                        error!("Failed to add {} to retry queue: {}", identity, queue_err);
                    }
                }
                self.audit(
                    LogLevel::Error,
                    format!("Failed to deliver {}", identity),
                    json!({
                        "bucket": identity.bucket,
                        "key": identity.key,
                        "error": err.to_string(),
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn deliver(&self, identity: &ObjectIdentity, staging: &Path) -> RelayResult<Delivery> {
        fs::create_dir_all(staging).await?;
        let staged = staging.join(staged_file_name(identity.file_name()));

        self.fetch(identity, &staged).await?;

        if self.chunker.should_split(&staged).await? {
            info!(
                "File requires splitting (>= {})",
                captions::format_bytes(self.chunker.split_threshold())
            );
            self.deliver_chunked(identity, &staged, staging).await
        } else {
            self.deliver_whole(identity, &staged).await
        }
    }

    /// Stream the object into `dest`, optionally checking its MD5.
    async fn fetch(&self, identity: &ObjectIdentity, dest: &Path) -> RelayResult<u64> {
        debug!("Downloading: {}", identity);
        let mut stream = self.storage.get_object(&identity.bucket, &identity.key).await?;
        let mut file = File::create(dest).await?;
        let mut digest = md5::Context::new();
        let mut written: u64 = 0;

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|err| RelayError::transport(format!("download interrupted: {}", err)))?;
            if self.settings.verify_etag {
                digest.consume(&piece);
            }
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if self.settings.verify_etag {
            if let Some(expected) = plain_md5_etag(&identity.etag) {
                let actual = format!("{:x}", digest.compute());
                if actual != expected {
                    return Err(RelayError::transport(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        identity, expected, actual
                    )));
                }
            }
        }

        if written != identity.size {
            debug!("{} listed as {} bytes, downloaded {}", identity, identity.size, written);
        }
        Ok(written)
    }

    async fn deliver_whole(&self, identity: &ObjectIdentity, staged: &Path) -> RelayResult<Delivery> {
        let caption = captions::file_caption(identity);

        self.limiter.acquire().await;
        let delivery_ref = self
            .messenger
            .send_document(&self.settings.destination, staged, &caption)
            .await?;
        info!("Sent {} (message ID: {})", identity, delivery_ref);

        let refs = vec![delivery_ref.0];
        self.ledger
            .write_sent_record(&identity.bucket, &identity.key, &identity.etag, identity.size, 1, &refs)
            .await?;

        Ok(Delivery {
            chunk_count: 1,
            delivery_refs: refs,
        })
    }

    async fn deliver_chunked(
        &self,
        identity: &ObjectIdentity,
        staged: &Path,
        staging: &Path,
    ) -> RelayResult<Delivery> {
        let chunks = self.chunker.split(staged, staging).await?;
        let total = chunks.len() as u32;
        info!("Split {} into {} chunks", identity, total);

        let mut refs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let caption = captions::chunk_caption(identity, chunk.part_number, total, chunk.byte_length)?;

            self.limiter.acquire().await;
            let delivery_ref = match self
                .messenger
                .send_document(&self.settings.destination, &chunk.local_path, &caption)
                .await
            {
                Ok(r) => r,
                Err(err) => {
                    error!("Failed to send chunk {}/{} of {}", chunk.part_number, total, identity);
                    return Err(err.into());
                }
            };

            info!(
                "Chunk {}/{} of {} sent (message ID: {})",
                chunk.part_number, total, identity, delivery_ref
            );
            refs.push(delivery_ref.0);
            remove_file_best_effort(&chunk.local_path).await;
        }

        self.ledger
            .write_sent_record(&identity.bucket, &identity.key, &identity.etag, identity.size, total, &refs)
            .await?;

        Ok(Delivery {
            chunk_count: total,
            delivery_refs: refs,
        })
    }

    async fn audit(&self, level: LogLevel, message: String, metadata: serde_json::Value) {
        if let Err(err) = self.ledger.add_log(level, &message, Some(metadata)).await {
            warn!("Failed to write log entry: {}", err);
        }
    }
}

/// Lowercase hex digest when `etag` is a single-part MD5 etag.
fn plain_md5_etag(etag: &str) -> Option<String> {
    let trimmed = etag.trim().trim_matches('"');
    (trimmed.len() == 32 && trimmed.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| trimmed.to_ascii_lowercase())
}

fn staged_file_name(name: &str) -> String {
    match name {
        "" | "." | ".." => "object".to_string(),
        other => other.replace('\\', "_"),
    }
}

async fn remove_file_best_effort(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Cleaned up: {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to cleanup {}: {}", path.display(), err),
    }
}

async fn remove_dir_best_effort(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => debug!("Cleaned up staging {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to cleanup {}: {}", path.display(), err),
    }
}
