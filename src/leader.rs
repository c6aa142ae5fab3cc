// etcd-backup/src/leader.rs
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::errors::{AppError, Result};

/// Peer state reported by etcd for the member that is currently the raft leader.
pub const LEADER_STATE: &str = "StateLeader";

#[async_trait]
pub trait LeaderCheck: Send + Sync {
    async fn is_leader(&self) -> Result<bool>;
}

/// Used when no client URL is configured: every node backs up.
pub struct AlwaysLeader;

#[async_trait]
impl LeaderCheck for AlwaysLeader {
    async fn is_leader(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Asks the local member for its own stats (`/v2/stats/self`).
pub struct EtcdStatsLeaderCheck {
    client: reqwest::Client,
    stats_url: Url,
}

#[derive(Debug, Deserialize)]
struct SelfStats {
    state: String,
}

impl EtcdStatsLeaderCheck {
    pub fn new(client_url: &Url) -> Result<Self> {
        let stats_url = Url::parse(&format!("{}/v2/stats/self", client_url.as_str().trim_end_matches('/')))
            .map_err(|e| AppError::Config(format!("Invalid ETCD_CLIENT_URL {}: {}", client_url, e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            stats_url,
        })
    }
}

#[async_trait]
impl LeaderCheck for EtcdStatsLeaderCheck {
    async fn is_leader(&self) -> Result<bool> {
        debug!("Checking local etcd peer state at {} ...", self.stats_url);
        let response = self
            .client
            .get(self.stats_url.clone())
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        let state = parse_peer_state(&body)?;
        debug!("Peer state: {}", state);
        Ok(state == LEADER_STATE)
    }
}

/// Extracts the `state` field from a `/v2/stats/self` response body.
fn parse_peer_state(body: &[u8]) -> Result<String> {
    let stats: SelfStats = serde_json::from_slice(body)
        .map_err(|e| AppError::LeadershipCheck(format!("Unexpected peer stats response: {}", e)))?;
    Ok(stats.state)
}

/// Picks the leader check for the configured client URL.
pub fn leader_check_from_config(client_url: Option<&Url>) -> Result<Arc<dyn LeaderCheck>> {
    match client_url {
        Some(url) => Ok(Arc::new(EtcdStatsLeaderCheck::new(url)?)),
        None => Ok(Arc::new(AlwaysLeader)),
    }
}
