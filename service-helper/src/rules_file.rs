use std::fs::Permissions;
use std::io;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::errors::UdevRulesError;

const RULES_FILE_MODE: u32 = 0o644;

/// Builds one udev rule that re-runs `cmd` as `user` whenever the file
/// system with `uuid` shows up.
pub fn rule_line(su: &str, user: &str, uuid: &str, cmd: &str) -> String {
    format!("ACTION==\"add|change\", ENV{{ID_FS_UUID}}==\"{uuid}\", RUN+=\"{su} - '{user}' -c '{cmd}'\"\n")
}

/// The directory holding one `99-backintime-<user>.rules` file per user.
#[derive(Debug, Clone)]
pub struct RulesDir {
    dir: PathBuf,
}

impl RulesDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, user: &str) -> PathBuf {
        self.dir.join(format!("99-backintime-{user}.rules"))
    }

    /// Current contents, or `None` if the user has no rules file.
    pub async fn read(&self, user: &str) -> Result<Option<Vec<u8>>, UdevRulesError> {
        let path = self.path_for(user);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(UdevRulesError::io(
                format!("failed to read {}", path.display()),
                err,
            )),
        }
    }

    pub async fn exists(&self, user: &str) -> Result<bool, UdevRulesError> {
        let path = self.path_for(user);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| UdevRulesError::io(format!("failed to stat {}", path.display()), err))
    }

    /// Replaces the user's rules file in one rename so readers see either
    /// the old or the new contents.
    pub async fn write_atomic(&self, user: &str, contents: Vec<u8>) -> Result<(), UdevRulesError> {
        let dir = self.dir.clone();
        let path = self.path_for(user);
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic_blocking(&dir, &target, &contents))
            .await
            .map_err(|err| {
                UdevRulesError::io(
                    format!("failed to write {}", path.display()),
                    io::Error::other(err),
                )
            })?
            .map_err(|err| UdevRulesError::io(format!("failed to write {}", path.display()), err))
    }

    pub async fn remove(&self, user: &str) -> Result<(), UdevRulesError> {
        let path = self.path_for(user);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UdevRulesError::io(
                format!("failed to remove {}", path.display()),
                err,
            )),
        }
    }
}

fn write_atomic_blocking(dir: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file()
        .set_permissions(Permissions::from_mode(RULES_FILE_MODE))?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|err| err.error)?;
    Ok(())
}
