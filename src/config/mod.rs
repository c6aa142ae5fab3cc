// etcd-backup/src/config/mod.rs
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::errors::{AppError, Result};

const DEFAULT_DATA_DIR: &str = "/var/lib/etcd";
const DEFAULT_BACKUP_BASE_DIR: &str = "/tmp";
const DEFAULT_BACKUP_INTERVAL_SEC: u64 = 60;
const DEFAULT_DOGSTATSD_HOST: &str = "127.0.0.1";
const DEFAULT_DOGSTATSD_PORT: u16 = 8125;

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub folder_prefix: String,
    /// Overrides the AWS endpoint, e.g. for a fake S3 backend in tests.
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsConfig {
    Disabled,
    DogStatsd { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub s3: S3Config,
    pub data_dir: PathBuf,
    pub backup_base_dir: PathBuf,
    pub backup_interval: Duration,
    pub run_once: bool,
    pub etcd_client_url: Option<Url>,
    pub etcdctl_path: Option<PathBuf>,
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| AppError::Config(format!("Missing required env var: {}", name)))
        };
        // Empty optional values behave as unset.
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bucket_name = required("S3_BUCKET")?;
        let folder_prefix = required("S3_PREFIX")?;
        if bucket_name.trim().is_empty() {
            return Err(AppError::Config("S3_BUCKET cannot be empty".to_string()));
        }

        let backup_interval = match optional("BACKUP_INTERVAL_SEC") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    AppError::Config(format!("BACKUP_INTERVAL_SEC must be a whole number of seconds, got {:?}", raw))
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_BACKUP_INTERVAL_SEC),
        };

        let etcd_client_url = optional("ETCD_CLIENT_URL")
            .map(|raw| {
                Url::parse(&raw)
                    .map_err(|e| AppError::Config(format!("Invalid ETCD_CLIENT_URL {:?}: {}", raw, e)))
            })
            .transpose()?;

        let metrics = if lookup("DOGSTATSD_METRICS_ENABLED").as_deref() == Some("true") {
            let port = match optional("DOGSTATSD_PORT") {
                Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                    AppError::Config(format!("DOGSTATSD_PORT must be a port number, got {:?}", raw))
                })?,
                None => DEFAULT_DOGSTATSD_PORT,
            };
            MetricsConfig::DogStatsd {
                host: optional("DOGSTATSD_HOST").unwrap_or_else(|| DEFAULT_DOGSTATSD_HOST.to_string()),
                port,
            }
        } else {
            MetricsConfig::Disabled
        };

        Ok(AppConfig {
            s3: S3Config {
                bucket_name,
                folder_prefix,
                endpoint_url: optional("S3_ENDPOINT_URL"),
            },
            data_dir: PathBuf::from(optional("ETCD_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())),
            backup_base_dir: PathBuf::from(
                optional("BACKUP_BASE_DIR").unwrap_or_else(|| DEFAULT_BACKUP_BASE_DIR.to_string()),
            ),
            backup_interval,
            run_once: lookup("RUN_ONCE").as_deref() == Some("true"),
            etcd_client_url,
            etcdctl_path: optional("ETCDCTL_PATH").map(PathBuf::from),
            metrics,
        })
    }
}

/// Usage text printed when the configuration cannot be loaded.
pub fn usage(program: &str) -> String {
    format!(
        r#"
Usage: {program}

Required env vars:
  S3_BUCKET: S3 bucket to upload backup tarball
  S3_PREFIX: S3 prefix added to S3 object (useful for backing up multiple clusters into the same bucket)

Optional env vars:
  BACKUP_INTERVAL_SEC: number of seconds between the starts of backup runs (default: 60)
  BACKUP_BASE_DIR: directory where snapshots and tarballs are staged (default: /tmp)
  ETCD_CLIENT_URL: URL for reaching etcd to detect if we are talking to the leader
  ETCD_DATA_DIR: etcd data directory (default: /var/lib/etcd)
  ETCDCTL_PATH: etcdctl binary to use (default: etcdctl from PATH)
  LOG_LEVEL: one of ERROR, WARN, INFO, DEBUG, TRACE (default: INFO)
  RUN_ONCE: if "true", run once and exit
  S3_ENDPOINT_URL: alternative S3 endpoint, e.g. a fake S3 backend

Dogstatsd settings:
  DOGSTATSD_METRICS_ENABLED: if "true", submit upload metrics (default: false)

  If Dogstatsd metrics are enabled, the following vars are used:

      DOGSTATSD_HOST (default: 127.0.0.1)
      DOGSTATSD_PORT (default: 8125)
"#
    )
}
