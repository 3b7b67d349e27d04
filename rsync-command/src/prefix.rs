use bit_process::CommandVector;
use tracing::warn;

use crate::capabilities::PROGRESS2;
use crate::capabilities::RsyncCapabilities;
use crate::profile::RsyncProfile;
use crate::profile::SnapshotMode;
use crate::profile::SshSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixOptions {
    /// Skip permissions, group and owner. Overridden when ACLs or xattrs are
    /// preserved.
    pub no_perms: bool,
    /// Modes for which the ssh transport options are added.
    pub use_modes: Vec<SnapshotMode>,
    /// Ask for `--info=progress2` when the binary supports it.
    pub progress: bool,
}

impl Default for PrefixOptions {
    fn default() -> Self {
        Self {
            no_perms: true,
            use_modes: vec![SnapshotMode::Ssh, SnapshotMode::SshEncfs],
            progress: true,
        }
    }
}

const BASE_FLAGS: [&str; 7] = [
    "--recursive",
    "--times",
    "--devices",
    "--specials",
    "--hard-links",
    "--human-readable",
    "-s",
];

/// The `rsync` command for taking a snapshot, without include/exclude
/// filters, source and destination.
pub fn rsync_prefix(
    profile: &RsyncProfile,
    caps: &RsyncCapabilities,
    options: &PrefixOptions,
) -> CommandVector {
    let mut command = if profile.nocache_on_local {
        let mut command = CommandVector::new("nocache");
        command.arg("rsync");
        command
    } else {
        CommandVector::new("rsync")
    };
    command.args(BASE_FLAGS);

    if profile.use_checksum || profile.force_checksum {
        command.arg("--checksum");
    }
    if profile.copy_unsafe_links {
        command.arg("--copy-unsafe-links");
    }
    command.arg(if profile.copy_links {
        "--copy-links"
    } else {
        "--links"
    });
    if profile.one_file_system {
        command.arg("--one-file-system");
    }

    let mut no_perms = options.no_perms;
    if profile.preserve_acl && caps.contains("ACLs") {
        command.arg("--acls");
        no_perms = false;
    }
    if profile.preserve_xattr && caps.contains("xattrs") {
        command.arg("--xattrs");
        no_perms = false;
    }
    if no_perms {
        command.args(["--no-perms", "--no-group", "--no-owner"]);
    } else {
        command.args(["--perms", "--executability", "--group", "--owner"]);
    }

    if options.progress && caps.contains(PROGRESS2) {
        command.args(["--info=progress2", "--no-inc-recursive"]);
    }
    if let Some(limit) = profile.bwlimit {
        command.arg(format!("--bwlimit={limit}"));
    }
    if let Some(extra) = profile.rsync_options.as_deref() {
        match shlex::split(extra) {
            Some(words) => {
                command.args(words);
            }
            None => warn!("ignoring unparsable rsync options: {extra}"),
        }
    }

    command.args(rsync_ssh_args(profile, &options.use_modes));
    command
}

/// Transport options for ssh profiles. Empty for local modes and for modes
/// not listed in `use_modes`.
pub fn rsync_ssh_args(profile: &RsyncProfile, use_modes: &[SnapshotMode]) -> Vec<String> {
    if !profile.mode.is_ssh() || !use_modes.contains(&profile.mode) {
        return Vec::new();
    }
    let default_ssh = SshSettings::default();
    let ssh = profile.ssh.as_ref().unwrap_or(&default_ssh);

    let rsh = if ssh.command.is_empty() {
        "ssh".to_string()
    } else {
        ssh.command.join(" ")
    };
    let mut args = vec![format!("--rsh={rsh}")];

    if ssh.nice_on_remote || ssh.ionice_on_remote || ssh.nocache_on_remote {
        let mut rsync_path = String::from("--rsync-path=");
        if ssh.nice_on_remote {
            rsync_path.push_str("nice -n 19 ");
        }
        if ssh.ionice_on_remote {
            rsync_path.push_str("ionice -c2 -n7 ");
        }
        if ssh.nocache_on_remote {
            rsync_path.push_str("nocache ");
        }
        rsync_path.push_str("rsync");
        args.push(rsync_path);
    }
    args
}

/// The `rsync` command used to delete a snapshot by syncing an empty
/// directory over it. `run_local` adds the ssh transport for remote
/// profiles.
pub fn rsync_remove(profile: &RsyncProfile, run_local: bool) -> CommandVector {
    let mut command = CommandVector::new("rsync");
    command.args(["-a", "--delete", "-s"]);
    if run_local {
        command.args(rsync_ssh_args(
            profile,
            &[SnapshotMode::Ssh, SnapshotMode::SshEncfs],
        ));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn caps(tokens: &str) -> RsyncCapabilities {
        RsyncCapabilities::parse(&format!(
            "rsync  version 3.2.7  protocol version 31\nCapabilities:\n    {tokens}\n\n"
        ))
    }

    fn argv(command: &CommandVector) -> Vec<&str> {
        command.argv().iter().map(String::as_str).collect()
    }

    fn ssh_profile() -> RsyncProfile {
        RsyncProfile {
            mode: SnapshotMode::Ssh,
            ssh: Some(SshSettings {
                command: vec![
                    "ssh".to_string(),
                    "-p".to_string(),
                    "22".to_string(),
                    "-o".to_string(),
                    "ServerAliveInterval=240".to_string(),
                ],
                ..SshSettings::default()
            }),
            ..RsyncProfile::default()
        }
    }

    #[test]
    fn default_local_profile() {
        let command = rsync_prefix(
            &RsyncProfile::default(),
            &RsyncCapabilities::default(),
            &PrefixOptions::default(),
        );
        assert_eq!(
            argv(&command),
            vec![
                "rsync",
                "--recursive",
                "--times",
                "--devices",
                "--specials",
                "--hard-links",
                "--human-readable",
                "-s",
                "--links",
                "--no-perms",
                "--no-group",
                "--no-owner",
            ]
        );
    }

    #[test]
    fn acls_need_the_capability() {
        let profile = RsyncProfile {
            preserve_acl: true,
            preserve_xattr: true,
            ..RsyncProfile::default()
        };
        let command = rsync_prefix(&profile, &caps("xattrs"), &PrefixOptions::default());
        let argv = argv(&command);

        assert!(!argv.contains(&"--acls"));
        assert!(argv.contains(&"--xattrs"));
        assert!(argv.contains(&"--perms"));
        assert!(!argv.contains(&"--no-perms"));
    }

    #[test]
    fn full_profile_keeps_the_documented_order() {
        let profile = RsyncProfile {
            nocache_on_local: true,
            force_checksum: true,
            copy_unsafe_links: true,
            copy_links: true,
            one_file_system: true,
            preserve_acl: true,
            bwlimit: Some(3000),
            rsync_options: Some("--exclude-from='/etc/my excludes' -v".to_string()),
            ..ssh_profile()
        };
        let command = rsync_prefix(&profile, &caps("ACLs, xattrs"), &PrefixOptions::default());

        assert_eq!(
            argv(&command),
            vec![
                "nocache",
                "rsync",
                "--recursive",
                "--times",
                "--devices",
                "--specials",
                "--hard-links",
                "--human-readable",
                "-s",
                "--checksum",
                "--copy-unsafe-links",
                "--copy-links",
                "--one-file-system",
                "--acls",
                "--perms",
                "--executability",
                "--group",
                "--owner",
                "--info=progress2",
                "--no-inc-recursive",
                "--bwlimit=3000",
                "--exclude-from=/etc/my excludes",
                "-v",
                "--rsh=ssh -p 22 -o ServerAliveInterval=240",
            ]
        );
    }

    #[test]
    fn progress_needs_both_option_and_capability() {
        let options = PrefixOptions {
            progress: false,
            ..PrefixOptions::default()
        };
        let command = rsync_prefix(&RsyncProfile::default(), &caps("ACLs"), &options);
        assert!(!argv(&command).contains(&"--info=progress2"));

        let old = RsyncCapabilities::parse("rsync  version 3.0.9  protocol version 30\n");
        let command = rsync_prefix(&RsyncProfile::default(), &old, &PrefixOptions::default());
        assert!(!argv(&command).contains(&"--info=progress2"));
    }

    #[test]
    fn hostile_options_stay_single_arguments() {
        let profile = RsyncProfile {
            rsync_options: Some(r#"--log-file="/tmp/x; rm -rf /" '$(reboot)'"#.to_string()),
            ..RsyncProfile::default()
        };
        let command = rsync_prefix(
            &profile,
            &RsyncCapabilities::default(),
            &PrefixOptions::default(),
        );
        let argv = argv(&command);

        assert!(argv.contains(&"--log-file=/tmp/x; rm -rf /"));
        assert!(argv.contains(&"$(reboot)"));
    }

    #[test]
    fn unbalanced_quotes_drop_the_custom_options() {
        let profile = RsyncProfile {
            rsync_options: Some("--exclude='unterminated".to_string()),
            ..RsyncProfile::default()
        };
        let with = rsync_prefix(
            &profile,
            &RsyncCapabilities::default(),
            &PrefixOptions::default(),
        );
        let without = rsync_prefix(
            &RsyncProfile::default(),
            &RsyncCapabilities::default(),
            &PrefixOptions::default(),
        );
        assert_eq!(with, without);
    }

    #[test]
    fn ssh_args_respect_mode_and_use_modes() {
        let profile = ssh_profile();
        assert_eq!(
            rsync_ssh_args(&profile, &[SnapshotMode::Ssh]),
            vec!["--rsh=ssh -p 22 -o ServerAliveInterval=240".to_string()]
        );
        assert!(rsync_ssh_args(&profile, &[SnapshotMode::SshEncfs]).is_empty());
        assert!(
            rsync_ssh_args(
                &RsyncProfile::default(),
                &[SnapshotMode::Local, SnapshotMode::Ssh]
            )
            .is_empty()
        );
    }

    #[test]
    fn remote_niceness_builds_rsync_path() {
        let mut profile = ssh_profile();
        if let Some(ssh) = profile.ssh.as_mut() {
            ssh.nice_on_remote = true;
            ssh.ionice_on_remote = true;
            ssh.nocache_on_remote = true;
        }
        assert_eq!(
            rsync_ssh_args(&profile, &[SnapshotMode::Ssh]),
            vec![
                "--rsh=ssh -p 22 -o ServerAliveInterval=240".to_string(),
                "--rsync-path=nice -n 19 ionice -c2 -n7 nocache rsync".to_string(),
            ]
        );

        if let Some(ssh) = profile.ssh.as_mut() {
            ssh.nice_on_remote = false;
            ssh.nocache_on_remote = false;
        }
        assert_eq!(
            rsync_ssh_args(&profile, &[SnapshotMode::Ssh])[1],
            "--rsync-path=ionice -c2 -n7 rsync"
        );
    }

    #[test]
    fn remove_command() {
        let profile = ssh_profile();
        assert_eq!(
            argv(&rsync_remove(&profile, false)),
            vec!["rsync", "-a", "--delete", "-s"]
        );
        assert_eq!(
            argv(&rsync_remove(&profile, true)),
            vec![
                "rsync",
                "-a",
                "--delete",
                "-s",
                "--rsh=ssh -p 22 -o ServerAliveInterval=240",
            ]
        );
        assert_eq!(
            argv(&rsync_remove(&RsyncProfile::default(), true)),
            vec!["rsync", "-a", "--delete", "-s"]
        );
    }
}
