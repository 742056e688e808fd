use thiserror::Error;

use crate::store::ConfigKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("transport i/o failure: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("backend rejected credentials with HTTP {status}")]
    Rejected { status: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
    #[error("no session to refresh")]
    NoSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store i/o failure on `{key}`: {message}")]
    Io { key: &'static str, message: String },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("configuration document `{}` is missing", .key.as_str())]
    ConfigMissing { key: ConfigKey },
    #[error("configuration document `{}` is invalid: {reason}", .key.as_str())]
    ConfigInvalid { key: ConfigKey, reason: String },
    #[error("network join failed after {attempts} status polls")]
    NetworkJoinFailed { attempts: u32 },
    #[error("authentication failed: {0}")]
    AuthFailed(#[from] AuthError),
    #[error("telemetry upload failed with HTTP {status}")]
    UploadFailed { status: u16 },
    #[error("telemetry upload transport failure: {0}")]
    UploadTransport(TransportError),
    #[error("environment profile has no id")]
    ProfileIncomplete,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MonitorError {
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigMissing { .. } | Self::ConfigInvalid { .. } | Self::Store(_)
        )
    }
}
