//! Stages udev rules per caller and commits them once the caller is
//! authorized.
//!
//! Staged rules live only in memory and are keyed by [`OwnerToken`], so
//! two connections of the same user never see each other's staging. Calls
//! of one owner are serialized by a per-owner lock that is held across the
//! whole call, including a possibly slow authorization prompt; other owners
//! are only blocked by the short critical sections around the staged map
//! and by the final file write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::authorization::AuthorizationOracle;
use crate::authorization::UDEV_RULE_DELETE;
use crate::authorization::UDEV_RULE_SAVE;
use crate::config::Limits;
use crate::config::Programs;
use crate::errors::UdevRulesError;
use crate::identity::OwnerToken;
use crate::identity::SenderInfo;
use crate::rules_file::RulesDir;
use crate::rules_file::rule_line;
use crate::validate::check_cmd_chars;
use crate::validate::check_cmd_shape;
use crate::validate::check_uuid_chars;

pub struct UdevRules {
    programs: Programs,
    limits: Limits,
    rules_dir: RulesDir,
    oracle: Arc<dyn AuthorizationOracle>,
    staged: StdMutex<HashMap<OwnerToken, Vec<String>>>,
    owner_locks: StdMutex<HashMap<OwnerToken, Arc<AsyncMutex<()>>>>,
    write_lock: AsyncMutex<()>,
}

impl UdevRules {
    pub fn new(
        programs: Programs,
        limits: Limits,
        rules_dir: RulesDir,
        oracle: Arc<dyn AuthorizationOracle>,
    ) -> Self {
        Self {
            programs,
            limits,
            rules_dir,
            oracle,
            staged: StdMutex::new(HashMap::new()),
            owner_locks: StdMutex::new(HashMap::new()),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// Validates `cmd` and `uuid` and stages a rule for the caller. Never
    /// touches the rules file.
    pub async fn add_rule(
        &self,
        sender: &dyn SenderInfo,
        cmd: &str,
        uuid: &str,
    ) -> Result<(), UdevRulesError> {
        let result = self.add_rule_inner(sender, cmd, uuid).await;
        if let Err(err) = &result {
            warn!("rejected rule from {}: {err}", sender.name_owner());
        }
        result
    }

    async fn add_rule_inner(
        &self,
        sender: &dyn SenderInfo,
        cmd: &str,
        uuid: &str,
    ) -> Result<(), UdevRulesError> {
        check_cmd_chars(cmd)?;
        check_uuid_chars(uuid)?;
        check_cmd_shape(cmd, &self.programs)?;

        let user = sender.connection_unix_user()?;
        let owner = sender.name_owner();
        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;

        let rule = rule_line(&self.programs.su, &user, uuid, cmd);
        let mut staged = self.staged_map();
        self.check_limits(&staged, &owner, cmd)?;
        staged.entry(owner).or_default().push(rule);
        Ok(())
    }

    fn check_limits(
        &self,
        staged: &HashMap<OwnerToken, Vec<String>>,
        owner: &OwnerToken,
        cmd: &str,
    ) -> Result<(), UdevRulesError> {
        let Limits {
            max_rules,
            max_owners,
            max_cmd_len,
        } = self.limits;
        let owner_rules = staged.get(owner).map_or(0, Vec::len);
        if owner_rules >= max_rules {
            return Err(UdevRulesError::LimitExceeded(format!(
                "Maximum number of cached rules reached ({max_rules})"
            )));
        }
        // An owner that already has staged rules does not count as a new one.
        if !staged.contains_key(owner) && staged.len() >= max_owners {
            return Err(UdevRulesError::LimitExceeded(format!(
                "Maximum number of cached users reached ({max_owners})"
            )));
        }
        if cmd.len() > max_cmd_len {
            return Err(UdevRulesError::LimitExceeded(format!(
                "Maximum length of command line reached ({max_cmd_len})"
            )));
        }
        Ok(())
    }

    /// Writes the caller's staged rules to its rules file. Returns `false`
    /// when nothing had to be written.
    ///
    /// Without staged rules this is a [`UdevRules::delete`]. If the file
    /// already holds exactly the staged rules the staging is dropped without
    /// asking for authorization. A denied save keeps the staged rules so the
    /// caller can try again.
    pub async fn save(&self, sender: &dyn SenderInfo) -> Result<bool, UdevRulesError> {
        let owner = sender.name_owner();
        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;

        let user = sender.connection_unix_user()?;
        let Some(rules) = self.staged_rules(&owner) else {
            debug!("{owner} has no staged rules, deleting rules of {user}");
            self.delete_locked(sender, &owner, &user).await?;
            return Ok(false);
        };
        let contents = rules.concat().into_bytes();

        if self.rules_dir.read(&user).await?.as_deref() == Some(contents.as_slice()) {
            debug!("rules of {user} are unchanged");
            self.discard(&owner);
            return Ok(false);
        }

        self.authorize(sender, UDEV_RULE_SAVE).await?;
        {
            let _write = self.write_lock.lock().await;
            self.rules_dir.write_atomic(&user, contents).await?;
        }
        self.discard(&owner);
        info!(
            "saved {} udev rule(s) to {}",
            rules.len(),
            self.rules_dir.path_for(&user).display()
        );
        Ok(true)
    }

    /// Drops the caller's staged rules and removes its rules file, if any.
    pub async fn delete(&self, sender: &dyn SenderInfo) -> Result<(), UdevRulesError> {
        let owner = sender.name_owner();
        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;

        let user = sender.connection_unix_user()?;
        self.delete_locked(sender, &owner, &user).await
    }

    async fn delete_locked(
        &self,
        sender: &dyn SenderInfo,
        owner: &OwnerToken,
        user: &str,
    ) -> Result<(), UdevRulesError> {
        self.discard(owner);
        if !self.rules_dir.exists(user).await? {
            return Ok(());
        }

        self.authorize(sender, UDEV_RULE_DELETE).await?;
        {
            let _write = self.write_lock.lock().await;
            self.rules_dir.remove(user).await?;
        }
        info!("removed {}", self.rules_dir.path_for(user).display());
        Ok(())
    }

    /// Drops the caller's staged rules. Needs no authorization.
    pub async fn clean(&self, sender: &dyn SenderInfo) {
        let owner = sender.name_owner();
        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;
        self.discard(&owner);
    }

    /// Forgets everything about a caller that went away.
    pub async fn forget(&self, owner: &OwnerToken) {
        let lock = self.owner_lock(owner);
        {
            let _guard = lock.lock().await;
            self.discard(owner);
        }
        let mut locks = self
            .owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Somebody may still be waiting on the lock; keep it for them.
        if locks
            .get(owner)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2)
        {
            locks.remove(owner);
        }
    }

    /// Rules currently staged for `owner`, in insertion order.
    pub fn staged_rules(&self, owner: &OwnerToken) -> Option<Vec<String>> {
        self.staged_map()
            .get(owner)
            .filter(|rules| !rules.is_empty())
            .cloned()
    }

    pub fn staged_owner_count(&self) -> usize {
        self.staged_map().len()
    }

    async fn authorize(
        &self,
        sender: &dyn SenderInfo,
        privilege: &str,
    ) -> Result<(), UdevRulesError> {
        let subject = sender.subject()?;
        match self.oracle.check(&subject, privilege).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("{} was denied {privilege}", subject.owner);
                Err(UdevRulesError::PermissionDenied(privilege.to_string()))
            }
            Err(err) => {
                warn!(
                    "authorization of {privilege} for {} failed: {err:#}",
                    subject.owner
                );
                Err(UdevRulesError::PermissionDenied(privilege.to_string()))
            }
        }
    }

    fn discard(&self, owner: &OwnerToken) {
        self.staged_map().remove(owner);
    }

    fn owner_lock(&self, owner: &OwnerToken) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(owner.clone()).or_default())
    }

    fn staged_map(&self) -> std::sync::MutexGuard<'_, HashMap<OwnerToken, Vec<String>>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
