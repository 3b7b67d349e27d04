//! Messages exchanged over the service socket, one JSON document per line.

use serde::Deserialize;
use serde::Serialize;

use crate::errors::UdevRulesError;

/// Longest accepted line in either direction.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024;

/// The client sends this for every call.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Request {
    /// Echoed back in the matching [`Response`].
    pub id: u64,
    pub call: Call,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Call {
    AddRule { cmd: String, uuid: String },
    Save,
    Delete,
    Clean,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddRule { .. } => "addRule",
            Self::Save => "save",
            Self::Delete => "delete",
            Self::Clean => "clean",
        }
    }
}

/// The server answers every request with exactly one response.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Ok(Reply),
    Err(WireError),
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    /// `addRule`, `delete` and `clean` have no result.
    Done,
    /// Whether `save` actually wrote the rules file.
    Saved(bool),
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct WireError {
    pub name: String,
    pub message: String,
}

impl From<&UdevRulesError> for WireError {
    fn from(err: &UdevRulesError) -> Self {
        Self {
            name: err.error_name().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<WireError> for UdevRulesError {
    fn from(err: WireError) -> Self {
        UdevRulesError::from_wire(&err.name, err.message)
    }
}
