use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;
use semver::Version;
use tokio::process::Command;

/// Pseudo capability added when `rsync` is new enough for `--info=progress2`.
pub const PROGRESS2: &str = "progress2";

const PROGRESS2_MIN_VERSION: Version = Version::new(3, 1, 0);

static VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^rsync\s*version\s*v?(\d+)\.(\d+)(?:\.(\d+))?").ok());

/// Features reported by `rsync --version`, plus the parsed version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsyncCapabilities {
    version: Option<Version>,
    tokens: BTreeSet<String>,
}

impl RsyncCapabilities {
    /// Runs `<rsync> --version` and parses the output. Any failure yields an
    /// empty set so callers fall back to conservative flags.
    pub async fn probe(rsync: impl AsRef<Path>) -> Self {
        let rsync = rsync.as_ref();
        let output = match Command::new(rsync).arg("--version").output().await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("failed to run `{} --version`: {err}", rsync.display());
                return Self::default();
            }
        };
        match String::from_utf8(output.stdout) {
            Ok(text) => Self::parse(&text),
            Err(_) => {
                tracing::warn!("`{} --version` printed non UTF-8 output", rsync.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let version = VERSION_RE.as_ref().and_then(|re| re.captures(text)).and_then(|caps| {
            let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
            Some(Version::new(part(1)?, part(2)?, part(3).unwrap_or(0)))
        });
        if version.is_none() {
            tracing::debug!("no rsync version found in --version output");
        }

        let mut tokens = BTreeSet::new();
        if version
            .as_ref()
            .is_some_and(|version| *version >= PROGRESS2_MIN_VERSION)
        {
            tokens.insert(PROGRESS2.to_string());
        }
        tokens.extend(
            capabilities_block(text)
                .lines()
                .flat_map(|line| line.split(','))
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        );

        Self { version, tokens }
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

/// Text between `Capabilities:` and the next blank line; empty when either
/// marker is missing.
fn capabilities_block(text: &str) -> &str {
    let Some((_, rest)) = text.split_once("Capabilities:") else {
        return "";
    };
    match rest.find("\n\n") {
        Some(end) => &rest[..end],
        None => "",
    }
}
