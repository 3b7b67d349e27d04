//! Who is calling: the OS user behind a connection and a token that keys
//! its staged rules.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use nix::unistd::Uid;
use nix::unistd::User;
use tokio::net::UnixStream;

use crate::errors::UdevRulesError;

/// Identifies one connected peer for as long as it stays connected. Two
/// connections from the same OS user get different tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Hands out bus style unique names (`:1.1`, `:1.2`, ...).
pub fn next_owner_token() -> OwnerToken {
    let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    OwnerToken(format!(":1.{n}"))
}

/// Everything the authorization backend needs to know about a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub owner: OwnerToken,
    pub uid: u32,
    pub pid: Option<u32>,
}

/// Looks up the caller of a request. Implementations must not cache: the
/// peer may go away between two calls.
pub trait SenderInfo: Send + Sync {
    fn connection_unix_uid(&self) -> Result<u32, UdevRulesError>;

    /// The user name for [`SenderInfo::connection_unix_uid`].
    fn connection_unix_user(&self) -> Result<String, UdevRulesError>;

    fn connection_pid(&self) -> Result<Option<u32>, UdevRulesError>;

    fn name_owner(&self) -> OwnerToken;

    fn subject(&self) -> Result<Subject, UdevRulesError> {
        Ok(Subject {
            owner: self.name_owner(),
            uid: self.connection_unix_uid()?,
            pid: self.connection_pid()?,
        })
    }
}

/// Resolves the caller from the `SO_PEERCRED` credentials of its socket.
pub struct PeerSender<'a> {
    stream: &'a UnixStream,
    owner: OwnerToken,
}

impl<'a> PeerSender<'a> {
    pub fn new(stream: &'a UnixStream, owner: OwnerToken) -> Self {
        Self { stream, owner }
    }

    fn credentials(&self) -> Result<tokio::net::unix::UCred, UdevRulesError> {
        self.stream
            .peer_cred()
            .map_err(|err| UdevRulesError::Identity(format!("no peer credentials: {err}")))
    }
}

impl SenderInfo for PeerSender<'_> {
    fn connection_unix_uid(&self) -> Result<u32, UdevRulesError> {
        Ok(self.credentials()?.uid())
    }

    fn connection_unix_user(&self) -> Result<String, UdevRulesError> {
        let uid = self.connection_unix_uid()?;
        user_name_for_uid(uid)
    }

    fn connection_pid(&self) -> Result<Option<u32>, UdevRulesError> {
        Ok(self
            .credentials()?
            .pid()
            .and_then(|pid| u32::try_from(pid).ok()))
    }

    fn name_owner(&self) -> OwnerToken {
        self.owner.clone()
    }
}

/// Maps a uid to its login name through the system user database.
pub fn user_name_for_uid(uid: u32) -> Result<String, UdevRulesError> {
    let user = User::from_uid(Uid::from_raw(uid))
        .map_err(|err| {
            UdevRulesError::Identity(format!("user lookup for uid {uid} failed: {err}"))
        })?
        .ok_or_else(|| UdevRulesError::Identity(format!("no user with uid {uid}")))?;
    check_user_name(user.name)
}

/// The user name ends up in a file name and inside single quotes of the
/// rule, so it has to be a plain name.
pub(crate) fn check_user_name(name: String) -> Result<String, UdevRulesError> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('-')
        && !name.contains(['/', '\'', '"', '\\', '\n', ' ']);
    if plain {
        Ok(name)
    } else {
        Err(UdevRulesError::Identity(format!(
            "refusing unusual user name {name:?}"
        )))
    }
}
