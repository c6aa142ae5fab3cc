mod logic;
pub(crate) mod s3_upload;
pub(crate) mod archive;
pub(crate) mod snapshot;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::Result;
use crate::leader::leader_check_from_config;
use crate::metrics::sink_from_config;

pub use logic::{AgentSettings, BackupAgent};
use s3_upload::{S3ObjectStore, Uploader};
use snapshot::EtcdctlSnapshot;

/// Public entry point for the backup agent.
/// Wires the production collaborators from configuration and runs until
/// run-once completes or `cancel` fires.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    let leader = leader_check_from_config(app_config.etcd_client_url.as_ref())?;
    let snapshotter = Arc::new(EtcdctlSnapshot::new(app_config.etcdctl_path.clone()));
    let store = Arc::new(S3ObjectStore::from_config(&app_config.s3).await);
    let uploader = Uploader::new(store, sink_from_config(&app_config.metrics), &app_config.s3);

    let agent = BackupAgent::new(AgentSettings::from(app_config), leader, snapshotter, uploader);
    agent.run(&cancel).await;
    Ok(())
}
