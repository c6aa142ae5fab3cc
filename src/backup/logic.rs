use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive::create_tar_gz_archive;
use super::s3_upload::{UploadOutcome, Uploader};
use super::snapshot::SnapshotProducer;
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::leader::LeaderCheck;

const BACKUP_NAME_PREFIX: &str = "etcd-backup-";

/// Artifacts of a single cycle. Dropping it removes them from disk.
#[derive(Debug)]
pub struct BackupRun {
    pub timestamp: String,
    pub snapshot_dir: PathBuf,
    pub archive_path: PathBuf,
    pub s3_key: String,
}

impl BackupRun {
    pub fn new(base_dir: &Path, prefix: &str, started_at: DateTime<Utc>) -> Self {
        let timestamp = started_at.format("%Y-%m-%d-%H%M%S").to_string();
        let base_name = format!("{}{}", BACKUP_NAME_PREFIX, timestamp);
        let archive_name = format!("{}.tar.gz", base_name);
        BackupRun {
            snapshot_dir: base_dir.join(&base_name),
            archive_path: base_dir.join(&archive_name),
            s3_key: format!("{}{}", prefix, archive_name),
            timestamp,
        }
    }
}

impl Drop for BackupRun {
    fn drop(&mut self) {
        if self.snapshot_dir.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&self.snapshot_dir) {
                warn!("Failed to remove snapshot directory {}: {}", self.snapshot_dir.display(), e);
            }
        }
        if self.archive_path.is_file() {
            if let Err(e) = std::fs::remove_file(&self.archive_path) {
                warn!("Failed to remove tarball {}: {}", self.archive_path.display(), e);
            }
        }
        debug!("Cleaned up backup artifacts for {}", self.timestamp);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NotLeader,
    Uploaded { key: String, bytes: u64, attempts: u32 },
    Cancelled { key: String },
}

/// Static settings the agent needs from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub data_dir: PathBuf,
    pub backup_base_dir: PathBuf,
    pub prefix: String,
    pub interval: Duration,
    pub run_once: bool,
}

impl From<&AppConfig> for AgentSettings {
    fn from(config: &AppConfig) -> Self {
        AgentSettings {
            data_dir: config.data_dir.clone(),
            backup_base_dir: config.backup_base_dir.clone(),
            prefix: config.s3.folder_prefix.clone(),
            interval: config.backup_interval,
            run_once: config.run_once,
        }
    }
}

pub struct BackupAgent {
    settings: AgentSettings,
    leader: Arc<dyn LeaderCheck>,
    snapshotter: Arc<dyn SnapshotProducer>,
    uploader: Uploader,
}

impl BackupAgent {
    pub fn new(
        settings: AgentSettings,
        leader: Arc<dyn LeaderCheck>,
        snapshotter: Arc<dyn SnapshotProducer>,
        uploader: Uploader,
    ) -> Self {
        Self { settings, leader, snapshotter, uploader }
    }

    /// Runs cycles until run-once completes or `cancel` fires.
    ///
    /// Cycle errors are logged and never end the loop.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!(
            "Starting etcd-backup, running backup every {} seconds.",
            self.settings.interval.as_secs()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let cycle_started = tokio::time::Instant::now();
            match self.run_cycle(cancel).await {
                Ok(CycleOutcome::NotLeader) => info!("Local etcd member is not the leader, skipping backup"),
                Ok(CycleOutcome::Uploaded { key, bytes, attempts }) => {
                    info!("Backup {} completed ({} bytes, {} upload attempts)", key, bytes, attempts)
                }
                Ok(CycleOutcome::Cancelled { key }) => warn!("Backup {} abandoned due to shutdown", key),
                Err(e) => error!("Backup cycle failed during {} stage: {}", e.stage(), e),
            }

            if self.settings.run_once {
                info!("RUN_ONCE enabled, exiting.");
                break;
            }
            // Exit before sleeping rather than after.
            if cancel.is_cancelled() {
                break;
            }

            // Cycles start one interval apart; an overrunning cycle is followed immediately.
            let wait = self.settings.interval.saturating_sub(cycle_started.elapsed());
            debug!("Sleeping for {:?} until the next backup", wait);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One leadership check followed, on the leader, by snapshot, archive and upload.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        if !self.leader.is_leader().await? {
            return Ok(CycleOutcome::NotLeader);
        }

        let run = BackupRun::new(&self.settings.backup_base_dir, &self.settings.prefix, Utc::now());
        info!("Starting backup {}", run.s3_key);

        self.snapshotter.snapshot(&self.settings.data_dir, &run.snapshot_dir).await?;

        let artifact = {
            let source = run.snapshot_dir.clone();
            let dest = run.archive_path.clone();
            tokio::task::spawn_blocking(move || create_tar_gz_archive(&source, &dest))
                .await
                .map_err(|e| AppError::Archive(format!("Archive task failed: {}", e)))??
        };
        debug!(
            "Archived {} ({} bytes, md5 {})",
            artifact.path.display(),
            artifact.size_bytes,
            hex::encode(artifact.md5)
        );

        let outcome = match self.uploader.upload(&run.s3_key, &run.archive_path, cancel).await? {
            UploadOutcome::Uploaded { bytes, attempts } => CycleOutcome::Uploaded {
                key: run.s3_key.clone(),
                bytes,
                attempts,
            },
            UploadOutcome::Cancelled => CycleOutcome::Cancelled { key: run.s3_key.clone() },
        };
        Ok(outcome)
    }
}
