use serde::Deserialize;
use serde::Serialize;

/// Where snapshots are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    #[default]
    Local,
    LocalEncfs,
    Ssh,
    SshEncfs,
}

impl SnapshotMode {
    pub fn is_ssh(self) -> bool {
        matches!(self, Self::Ssh | Self::SshEncfs)
    }
}

/// Remote side of an ssh profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Full ssh invocation without the user@host part, e.g.
    /// `["ssh", "-p", "22", "-o", "ServerAliveInterval=240"]`.
    pub command: Vec<String>,
    pub nice_on_remote: bool,
    pub ionice_on_remote: bool,
    pub nocache_on_remote: bool,
}

/// The rsync related part of a resolved snapshot profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsyncProfile {
    pub mode: SnapshotMode,
    pub nocache_on_local: bool,
    pub use_checksum: bool,
    /// Set for a single run when the user asked for a full checksum pass.
    pub force_checksum: bool,
    pub copy_unsafe_links: bool,
    pub copy_links: bool,
    pub one_file_system: bool,
    pub preserve_acl: bool,
    pub preserve_xattr: bool,
    /// KiB per second.
    pub bwlimit: Option<u32>,
    /// Extra options appended verbatim after word splitting.
    pub rsync_options: Option<String>,
    pub ssh: Option<SshSettings>,
}
