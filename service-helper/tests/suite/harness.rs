use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bit_service_helper::AuthorizationOracle;
use bit_service_helper::Limits;
use bit_service_helper::Programs;
use bit_service_helper::RulesDir;
use bit_service_helper::ServiceHelperClient;
use bit_service_helper::ServiceHelperServer;
use bit_service_helper::Subject;
use bit_service_helper::UdevRules;
use bit_service_helper::bind_socket;
use bit_service_helper::user_name_for_uid;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const BACKUP: &str = "/usr/bin/backintime --backup";

/// Grants or denies depending on a switch and counts the checks.
#[derive(Default)]
pub struct SwitchOracle {
    grant: AtomicBool,
    checks: AtomicUsize,
}

impl SwitchOracle {
    pub fn set_grant(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AuthorizationOracle for SwitchOracle {
    async fn check(&self, _subject: &Subject, _privilege: &str) -> anyhow::Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.grant.load(Ordering::SeqCst))
    }
}

pub fn programs() -> Programs {
    Programs {
        su: "/bin/su".to_string(),
        entry_point: "/usr/bin/backintime".to_string(),
        nice: "/usr/bin/nice".to_string(),
        ionice: "/usr/bin/ionice".to_string(),
    }
}

/// A service helper listening on a socket in a temporary directory.
pub struct TestService {
    _dir: TempDir,
    pub socket_path: PathBuf,
    pub rules: RulesDir,
    pub oracle: Arc<SwitchOracle>,
    pub broker: Arc<UdevRules>,
    /// Name of the user running the tests; the server sees it as the caller.
    pub user: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TestService {
    pub async fn start(limits: Limits) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let rules_path = dir.path().join("rules.d");
        std::fs::create_dir(&rules_path)?;
        let socket_path = dir.path().join("helper.sock");

        let rules = RulesDir::new(&rules_path);
        let oracle = Arc::new(SwitchOracle::default());
        oracle.set_grant(true);
        let broker = Arc::new(UdevRules::new(
            programs(),
            limits,
            rules.clone(),
            Arc::clone(&oracle) as Arc<dyn AuthorizationOracle>,
        ));

        let listener = bind_socket(&socket_path)?;
        let cancel = CancellationToken::new();
        let server = ServiceHelperServer::new(Arc::clone(&broker));
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.serve(listener, cancel).await }
        });

        let user = user_name_for_uid(nix::unistd::geteuid().as_raw())?;
        Ok(Self {
            _dir: dir,
            socket_path,
            rules,
            oracle,
            broker,
            user,
            cancel,
            task,
        })
    }

    pub async fn client(&self) -> anyhow::Result<ServiceHelperClient> {
        Ok(ServiceHelperClient::connect(&self.socket_path).await?)
    }

    pub async fn rules_text(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .rules
            .read(&self.user)
            .await?
            .map(String::from_utf8)
            .transpose()?)
    }

    /// Waits until no connection has staged rules any more.
    pub async fn wait_for_no_staging(&self) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.broker.staged_owner_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task).await??;
        Ok(())
    }
}
