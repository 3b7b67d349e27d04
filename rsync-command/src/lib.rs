//! Builds `rsync` argument vectors from a resolved snapshot profile and the
//! capabilities advertised by the installed `rsync` binary.

mod capabilities;
mod prefix;
mod profile;

pub use capabilities::PROGRESS2;
pub use capabilities::RsyncCapabilities;
pub use prefix::PrefixOptions;
pub use prefix::rsync_prefix;
pub use prefix::rsync_remove;
pub use prefix::rsync_ssh_args;
pub use profile::RsyncProfile;
pub use profile::SnapshotMode;
pub use profile::SshSettings;
