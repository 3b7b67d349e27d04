use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::process::Command;

use crate::config::AuthorizationBackend;
use crate::identity::Subject;

pub const UDEV_RULE_SAVE: &str = "net.launchpad.backintime.UdevRuleSave";
pub const UDEV_RULE_DELETE: &str = "net.launchpad.backintime.UdevRuleDelete";

/// Decides whether a caller holds a privilege. May be slow when the user is
/// asked for consent.
///
/// `Ok(false)` is a denial; an `Err` means the backend could not answer and
/// the broker treats it as a denial too.
#[async_trait::async_trait]
pub trait AuthorizationOracle: Send + Sync {
    async fn check(&self, subject: &Subject, privilege: &str) -> anyhow::Result<bool>;
}

pub fn oracle_for(backend: AuthorizationBackend) -> Arc<dyn AuthorizationOracle> {
    match backend {
        AuthorizationBackend::Polkit => Arc::new(Polkit::default()),
        AuthorizationBackend::None => Arc::new(Unenforced),
    }
}

/// Asks polkit via `pkcheck`, letting the agent of the caller's session
/// prompt for a password.
#[derive(Debug, Clone)]
pub struct Polkit {
    pkcheck: PathBuf,
}

impl Default for Polkit {
    fn default() -> Self {
        Self {
            pkcheck: which::which("pkcheck").unwrap_or_else(|_| PathBuf::from("/usr/bin/pkcheck")),
        }
    }
}

impl Polkit {
    pub fn with_pkcheck(pkcheck: impl Into<PathBuf>) -> Self {
        Self {
            pkcheck: pkcheck.into(),
        }
    }
}

#[async_trait::async_trait]
impl AuthorizationOracle for Polkit {
    async fn check(&self, subject: &Subject, privilege: &str) -> anyhow::Result<bool> {
        let pid = subject
            .pid
            .with_context(|| format!("caller {} did not report a pid", subject.owner))?;
        let start_time = process_start_time(pid).await?;

        let status = Command::new(&self.pkcheck)
            .arg("--action-id")
            .arg(privilege)
            .arg("--process")
            .arg(format!("{pid},{start_time},{}", subject.uid))
            .arg("--allow-user-interaction")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.pkcheck.display()))?;

        match status.code() {
            Some(0) => Ok(true),
            // Not authorized, challenge needed, or dismissed by the user.
            Some(1..=3) => Ok(false),
            _ => anyhow::bail!("pkcheck for {privilege} failed with {status}"),
        }
    }
}

/// Start time of `pid` in clock ticks since boot, as polkit expects it.
async fn process_start_time(pid: u32) -> anyhow::Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let stat = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    parse_start_time(&stat).with_context(|| format!("unexpected contents of {path}"))
}

fn parse_start_time(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses; fields are
    // counted from the last ')'. starttime is field 22, the state is 3.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

/// Grants everything. For running the service on a test bus where nobody
/// could answer a polkit prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unenforced;

#[async_trait::async_trait]
impl AuthorizationOracle for Unenforced {
    async fn check(&self, subject: &Subject, privilege: &str) -> anyhow::Result<bool> {
        tracing::warn!(
            "authorization not enforced: granting {privilege} to {} (uid {})",
            subject.owner,
            subject.uid
        );
        Ok(true)
    }
}
