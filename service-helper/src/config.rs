use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bit-service-helper.toml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/bit-service-helper.sock";
pub const DEFAULT_RULES_DIR: &str = "/etc/udev/rules.d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationBackend {
    /// Ask polkit through `pkcheck`.
    #[default]
    Polkit,
    /// Grant every request. Only for test setups.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Staged rules per owner.
    pub max_rules: usize,
    /// Owners with staged rules at the same time.
    pub max_owners: usize,
    /// Length of one rule's command.
    pub max_cmd_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rules: 100,
            max_owners: 20,
            max_cmd_len: 120,
        }
    }
}

/// Absolute paths of the programs a rule may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Programs {
    pub su: String,
    /// The only program a rule is allowed to run.
    pub entry_point: String,
    pub nice: String,
    pub ionice: String,
}

impl Programs {
    /// Looks each program up on `PATH`, falling back to the usual location.
    pub fn discover() -> Self {
        Self {
            su: which_or("su", "/bin/su"),
            entry_point: which_or("backintime", "/usr/bin/backintime"),
            nice: which_or("nice", "/usr/bin/nice"),
            ionice: which_or("ionice", "/usr/bin/ionice"),
        }
    }
}

fn which_or(program: &str, fallback: &str) -> String {
    match which::which(program) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => fallback.to_string(),
    }
}

/// On-disk form of the configuration. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServiceConfigToml {
    socket_path: Option<PathBuf>,
    rules_dir: Option<PathBuf>,
    max_rules: Option<usize>,
    max_owners: Option<usize>,
    max_cmd_len: Option<usize>,
    authorization: Option<AuthorizationBackend>,
    su: Option<String>,
    entry_point: Option<String>,
    nice: Option<String>,
    ionice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub rules_dir: PathBuf,
    pub limits: Limits,
    pub authorization: AuthorizationBackend,
    pub programs: Programs,
}

impl ServiceConfig {
    /// Reads `path`. A missing file yields the defaults; a file that exists
    /// but does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                String::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let toml: ServiceConfigToml = toml::from_str(contents)?;
        Ok(Self::from(toml))
    }
}

impl From<ServiceConfigToml> for ServiceConfig {
    fn from(toml: ServiceConfigToml) -> Self {
        let limits = Limits::default();
        let discovered = Programs::discover();
        let programs = Programs {
            su: toml.su.unwrap_or(discovered.su),
            entry_point: toml.entry_point.unwrap_or(discovered.entry_point),
            nice: toml.nice.unwrap_or(discovered.nice),
            ionice: toml.ionice.unwrap_or(discovered.ionice),
        };

        Self {
            socket_path: toml
                .socket_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            rules_dir: toml
                .rules_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RULES_DIR)),
            limits: Limits {
                max_rules: toml.max_rules.unwrap_or(limits.max_rules),
                max_owners: toml.max_owners.unwrap_or(limits.max_owners),
                max_cmd_len: toml.max_cmd_len.unwrap_or(limits.max_cmd_len),
            },
            authorization: toml.authorization.unwrap_or_default(),
            programs,
        }
    }
}
