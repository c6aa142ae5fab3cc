// etcd-backup/src/backup/snapshot.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};
use which::which;

use crate::errors::{AppError, Result};

/// Produces a self-contained copy of a live data directory.
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    /// `backup_dir` must not exist yet; it is created and populated on success.
    async fn snapshot(&self, data_dir: &Path, backup_dir: &Path) -> Result<()>;
}

/// Runs `etcdctl backup` against the data directory.
pub struct EtcdctlSnapshot {
    etcdctl: Option<PathBuf>,
}

impl EtcdctlSnapshot {
    /// With `None`, `etcdctl` is looked up on `PATH` for every snapshot.
    pub fn new(etcdctl: Option<PathBuf>) -> Self {
        Self { etcdctl }
    }

    fn executable(&self) -> Result<PathBuf> {
        match &self.etcdctl {
            Some(path) => Ok(path.clone()),
            None => which("etcdctl").map_err(|e| AppError::Snapshot {
                status: "not started".to_string(),
                output: format!("etcdctl executable not found in PATH: {}", e),
            }),
        }
    }
}

#[async_trait]
impl SnapshotProducer for EtcdctlSnapshot {
    async fn snapshot(&self, data_dir: &Path, backup_dir: &Path) -> Result<()> {
        debug!(
            "Backing up etcd data from {} to {}",
            data_dir.display(),
            backup_dir.display()
        );
        let etcdctl = self.executable()?;

        let output = Command::new(&etcdctl)
            .arg("backup")
            .arg(format!("--data-dir={}", data_dir.display()))
            .arg(format!("--backup-dir={}", backup_dir.display()))
            .output()
            .await
            .map_err(|e| AppError::Snapshot {
                status: "not started".to_string(),
                output: format!("Failed to execute {}: {}", etcdctl.display(), e),
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            error!("Error running etcdctl. Output: {}", combined);
            return Err(AppError::Snapshot {
                status: output.status.to_string(),
                output: combined,
            });
        }
        Ok(())
    }
}
