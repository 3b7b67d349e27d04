//! Privileged helper that installs per-user udev rules on behalf of
//! unprivileged callers.
//!
//! Callers connect to a Unix socket, stage rules with `addRule` and commit
//! them with `save`. Every rule is validated against a strict allow-list and
//! every change of a rules file needs authorization for the caller's
//! process.

mod authorization;
mod broker;
mod client;
mod config;
mod errors;
mod identity;
mod protocol;
mod rules_file;
mod server;
mod validate;

pub use authorization::AuthorizationOracle;
pub use authorization::Polkit;
pub use authorization::UDEV_RULE_DELETE;
pub use authorization::UDEV_RULE_SAVE;
pub use authorization::Unenforced;
pub use authorization::oracle_for;
pub use broker::UdevRules;
pub use client::ServiceHelperClient;
pub use config::AuthorizationBackend;
pub use config::DEFAULT_CONFIG_PATH;
pub use config::Limits;
pub use config::Programs;
pub use config::ServiceConfig;
pub use errors::ErrorKind;
pub use errors::UdevRulesError;
pub use identity::OwnerToken;
pub use identity::PeerSender;
pub use identity::SenderInfo;
pub use identity::Subject;
pub use identity::user_name_for_uid;
pub use protocol::Call;
pub use protocol::Outcome;
pub use protocol::Reply;
pub use protocol::Request;
pub use protocol::Response;
pub use rules_file::RulesDir;
pub use rules_file::rule_line;
pub use server::ServiceHelperServer;
pub use server::bind_socket;
