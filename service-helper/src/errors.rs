use std::io;

use thiserror::Error;

pub const INVALID_CHAR: &str = "net.launchpad.backintime.InvalidChar";
pub const INVALID_CMD: &str = "net.launchpad.backintime.InvalidCmd";
pub const LIMIT_EXCEEDED: &str = "net.launchpad.backintime.LimitExceeded";
pub const PERMISSION_DENIED: &str = "com.ubuntu.DeviceDriver.PermissionDeniedByPolicy";
pub const IDENTITY_UNAVAILABLE: &str = "net.launchpad.backintime.IdentityUnavailable";
pub const FAILED: &str = "net.launchpad.backintime.Failed";

/// Coarse classification callers use to decide whether to retry, fix their
/// input or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Quota,
    Authorization,
    Internal,
}

#[derive(Debug, Error)]
pub enum UdevRulesError {
    #[error("{0}")]
    InvalidChar(String),

    #[error("{0}")]
    InvalidCmd(String),

    #[error("{0}")]
    LimitExceeded(String),

    /// Carries the privilege that was refused.
    #[error("{0}")]
    PermissionDenied(String),

    #[error("cannot resolve caller identity: {0}")]
    Identity(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl UdevRulesError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable name reported over the wire.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::InvalidChar(_) => INVALID_CHAR,
            Self::InvalidCmd(_) => INVALID_CMD,
            Self::LimitExceeded(_) => LIMIT_EXCEEDED,
            Self::PermissionDenied(_) => PERMISSION_DENIED,
            Self::Identity(_) => IDENTITY_UNAVAILABLE,
            Self::Io { .. } => FAILED,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChar(_) | Self::InvalidCmd(_) => ErrorKind::Validation,
            Self::LimitExceeded(_) => ErrorKind::Quota,
            Self::PermissionDenied(_) => ErrorKind::Authorization,
            Self::Identity(_) | Self::Io { .. } => ErrorKind::Internal,
        }
    }

    /// Rebuilds an error received over the wire. Unknown names and I/O
    /// failures on the service side come back as [`UdevRulesError::Io`].
    pub fn from_wire(name: &str, message: String) -> Self {
        match name {
            INVALID_CHAR => Self::InvalidChar(message),
            INVALID_CMD => Self::InvalidCmd(message),
            LIMIT_EXCEEDED => Self::LimitExceeded(message),
            PERMISSION_DENIED => Self::PermissionDenied(message),
            IDENTITY_UNAVAILABLE => Self::Identity(message),
            _ => Self::Io {
                context: format!("service helper failed ({name})"),
                source: io::Error::other(message),
            },
        }
    }
}
