//! Supervisor errors, each with a stable machine-readable code.

use crate::server::{LaunchError, ServerError};

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("Server '{0}' not found")]
    UnknownServer(String),

    #[error("Supervisor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Extension '{name}' failed to load: {source:#}")]
    Extension {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateServer(_) => "DUPLICATE_SERVER",
            Self::UnknownServer(_) => "UNKNOWN_SERVER",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::Server(ServerError::Launch(LaunchError::RelativePath { .. })) => "INVALID_CONFIG",
            Self::Server(ServerError::Launch(_)) => "LAUNCH_FAILED",
            Self::Server(ServerError::NotRunning(_)) => "NOT_RUNNING",
            Self::Server(ServerError::Pattern(_)) => "INVALID_PATTERN",
            Self::Server(ServerError::Signal { .. }) => "SIGNAL_FAILED",
            Self::Extension { .. } => "EXTENSION_ERROR",
        }
    }
}
