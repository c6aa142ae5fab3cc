// etcd-backup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use s3::primitives::ByteStream;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::S3Config;
use crate::errors::{AppError, Result};
use crate::metrics::{MetricsSink, UPLOAD_BYTES_METRIC};

const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Streams `path` through MD5 in fixed-size chunks.
pub fn file_md5(path: &Path) -> std::io::Result<[u8; 16]> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Value of the `Content-MD5` header for a raw digest.
pub fn content_md5_header(digest: &[u8; 16]) -> String {
    BASE64.encode(digest)
}

/// Blocking-style write of a whole object; the store verifies `content_md5`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, file_path: &Path, content_md5: &str) -> Result<()>;
}

pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    /// Credentials and region come from the default AWS provider chain.
    pub async fn from_config(s3_config: &S3Config) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .load()
            .await;

        let mut builder = s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &s3_config.endpoint_url {
            // S3-compatible fakes rarely support virtual-hosted buckets.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: s3::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, file_path: &Path, content_md5: &str) -> Result<()> {
        debug!("Uploading {} to s3://{}/{}", file_path.display(), bucket, key);

        let body = ByteStream::from_path(file_path).await.map_err(|e| {
            AppError::S3Sdk(format!(
                "Failed to create ByteStream from file {}: {}",
                file_path.display(),
                e
            ))
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_md5(content_md5)
            .body(body)
            .send()
            .await?;
        Ok(())
    }
}

/// Bounded exponential backoff for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64, attempts: u32 },
    /// Shutdown was requested before an attempt succeeded.
    Cancelled,
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
    bucket: String,
    prefix: String,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, metrics: Arc<dyn MetricsSink>, s3_config: &S3Config) -> Self {
        Self {
            store,
            metrics,
            bucket: s3_config.bucket_name.clone(),
            prefix: s3_config.folder_prefix.clone(),
            policy: RetryPolicy::default(),
        }
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uploads `file_path` under `key`, retrying failed attempts with backoff.
    ///
    /// Returns [`UploadOutcome::Cancelled`] rather than an error when `cancel`
    /// fires before an attempt or while waiting to retry. Once every attempt has
    /// failed, the last failure is returned inside [`AppError::Upload`].
    pub async fn upload(&self, key: &str, file_path: &Path, cancel: &CancellationToken) -> Result<UploadOutcome> {
        // Size and digest are taken once, before any attempt.
        let (bytes, digest) = {
            let path: PathBuf = file_path.to_path_buf();
            tokio::task::spawn_blocking(move || -> std::io::Result<(u64, [u8; 16])> {
                let bytes = std::fs::metadata(&path)?.len();
                Ok((bytes, file_md5(&path)?))
            })
            .await
            .map_err(std::io::Error::other)
            .and_then(|read| read)
            .map_err(|source| AppError::UploadFile {
                path: file_path.display().to_string(),
                source,
            })?
        };
        let content_md5 = content_md5_header(&digest);
        debug!("Content-MD5 for {}: {}", file_path.display(), content_md5);

        let mut attempts_remaining = self.policy.max_attempts;
        let mut attempts = 0;
        let mut delay = self.policy.initial_delay;

        loop {
            if cancel.is_cancelled() {
                info!("Shutdown requested, abandoning upload of {}", key);
                return Ok(UploadOutcome::Cancelled);
            }

            attempts += 1;
            match self.store.put_object(&self.bucket, key, file_path, &content_md5).await {
                Ok(()) => {
                    info!("Uploaded s3://{}/{} ({} bytes)", self.bucket, key, bytes);
                    self.submit_metrics(bytes).await;
                    return Ok(UploadOutcome::Uploaded { bytes, attempts });
                }
                Err(e) => {
                    error!("Error uploading to S3 (attempt {}): {}", attempts, e);
                    attempts_remaining = attempts_remaining.saturating_sub(1);
                    if attempts_remaining == 0 {
                        return Err(AppError::Upload {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                }
            }

            if cancel.is_cancelled() {
                info!("Shutdown requested, abandoning upload of {}", key);
                return Ok(UploadOutcome::Cancelled);
            }
            warn!("Retrying upload in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested while waiting to retry upload of {}", key);
                    return Ok(UploadOutcome::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.policy.next_delay(delay);
        }
    }

    async fn submit_metrics(&self, file_size_bytes: u64) {
        let tags = [format!("bucket:{}", self.bucket), format!("prefix:{}", self.prefix)];
        self.metrics.increment(UPLOAD_BYTES_METRIC, file_size_bytes, &tags).await;
    }
}
