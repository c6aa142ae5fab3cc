use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Leadership check failed: {0}")]
    LeadershipCheck(String),

    #[error("etcdctl backup failed ({status}): {output}")]
    Snapshot { status: String, output: String },

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Upload failed after {attempts} attempts: {source}")]
    Upload {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    #[error("AWS SDK S3 error: {0}")]
    S3Sdk(String), // General S3 SDK errors

    #[error("Failed to read archive {path} for upload: {source}")]
    UploadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    /// Name of the backup stage the error belongs to, for log context.
    pub fn stage(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::LeadershipCheck(_) => "leadership-check",
            AppError::Snapshot { .. } => "snapshot",
            AppError::Archive(_) => "archive",
            AppError::Upload { .. } | AppError::S3Sdk(_) | AppError::UploadFile { .. } => "upload",
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::LeadershipCheck(err.to_string())
    }
}

impl<E, R> From<aws_sdk_s3::error::SdkError<E, R>> for AppError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    fn from(err: aws_sdk_s3::error::SdkError<E, R>) -> Self {
        // SdkError's own Display omits the service message.
        AppError::S3Sdk(format!("{}", aws_sdk_s3::error::DisplayErrorContext(&err)))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_error_keeps_last_cause() {
        let err = AppError::Upload {
            attempts: 10,
            source: Box::new(AppError::S3Sdk("SlowDown".to_string())),
        };
        assert_eq!(err.stage(), "upload");
        assert_eq!(
            err.to_string(),
            "Upload failed after 10 attempts: AWS SDK S3 error: SlowDown"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn unreadable_archive_is_an_upload_error() {
        let err = AppError::UploadFile {
            path: "/tmp/etcd-backup-2024-01-02-030405.tar.gz".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        };
        assert_eq!(err.stage(), "upload");
        assert!(err.to_string().contains("etcd-backup-2024-01-02-030405.tar.gz"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn snapshot_error_carries_output() {
        let err = AppError::Snapshot {
            status: "exit status: 1".to_string(),
            output: "no such directory".to_string(),
        };
        assert_eq!(err.stage(), "snapshot");
        assert!(err.to_string().contains("no such directory"));
    }
}
