use std::path::PathBuf;
use std::time::Duration;

use akrun_protocol::{ErrorKind, TaskId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AkrunError {
    #[error("timeout elapsed before a connection to {host} was established")]
    ConnectionTimeout { host: String },

    #[error("authentication on {host} failed: {reason}")]
    AuthError { host: String, reason: String },

    #[error("{host} probably refused the connection")]
    RefusedConnection { host: String },

    #[error("remote command timed out after {:?}: {command}", .after)]
    RemoteCommandTimeout { command: String, after: Duration },

    #[error("directory {host}:{path} does not exist")]
    DirectoryNotFound { host: String, path: String },

    #[error("directory {host}:{path} is not accessible for read/write")]
    DirectoryNotWritable { host: String, path: String },

    #[error("no snapshot found in {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("ambiguous period '{0}': calendar years/months cannot be combined with days/hours/minutes/seconds")]
    AmbiguousPeriod(String),

    #[error("invalid time format: {0}")]
    InvalidTimeFormat(String),

    #[error("task {task_id} stayed locked for {:?}", .waited)]
    StaleLock { task_id: TaskId, waited: Duration },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown application: {0}")]
    UnknownApp(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("remote job rejected: {0}")]
    RemoteJobRejected(String),

    #[error("run reported failure: {0}")]
    RunFailed(String),

    #[error("output is unparsable: {0}")]
    Unparsable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("output was already redirected")]
    AlreadyRedirected,

    #[error("output was not redirected")]
    NotRedirected,

    #[error("pty error: {0}")]
    Pty(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = AkrunError> = std::result::Result<T, E>;

impl AkrunError {
    /// Errors the remote session retry layer is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AkrunError::ConnectionTimeout { .. }
                | AkrunError::RefusedConnection { .. }
                | AkrunError::RemoteCommandTimeout { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AkrunError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            AkrunError::AuthError { .. } => ErrorKind::AuthError,
            AkrunError::RefusedConnection { .. } => ErrorKind::RefusedConnection,
            AkrunError::RemoteCommandTimeout { .. } => ErrorKind::RemoteCommandTimeout,
            AkrunError::DirectoryNotFound { .. } => ErrorKind::DirectoryNotFound,
            AkrunError::DirectoryNotWritable { .. } => ErrorKind::DirectoryNotWritable,
            AkrunError::SnapshotNotFound(_) => ErrorKind::SnapshotNotFound,
            AkrunError::AmbiguousPeriod(_) => ErrorKind::AmbiguousPeriod,
            AkrunError::InvalidTimeFormat(_) => ErrorKind::InvalidTimeFormat,
            AkrunError::StaleLock { .. } => ErrorKind::StaleLock,
            AkrunError::TaskNotFound(_)
            | AkrunError::UnknownResource(_)
            | AkrunError::UnknownApp(_) => ErrorKind::NotFound,
            AkrunError::RemoteJobRejected(_) => ErrorKind::RemoteJobRejected,
            AkrunError::RunFailed(_) => ErrorKind::RunFailed,
            AkrunError::Unparsable(_) => ErrorKind::Unparsable,
            AkrunError::InvalidRequest(_) | AkrunError::Template(_) | AkrunError::Config(_) => {
                ErrorKind::InvalidRequest
            }
            AkrunError::AlreadyRedirected
            | AkrunError::NotRedirected
            | AkrunError::Pty(_)
            | AkrunError::Store(_)
            | AkrunError::Io(_)
            | AkrunError::Json(_) => ErrorKind::ServerError,
        }
    }

    /// Error kind plus a message safe to hand to operators.
    pub fn to_error_code(&self) -> (ErrorKind, String) {
        match self {
            AkrunError::Store(_) => (self.kind(), "internal store error".to_string()),
            AkrunError::Io(_) => (self.kind(), "internal I/O error".to_string()),
            _ => (self.kind(), self.to_string()),
        }
    }
}
