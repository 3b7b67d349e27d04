//! Allow-list checks for the untrusted strings of `addRule`.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::config::Programs;
use crate::errors::UdevRulesError;

static CMD_FORBIDDEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-/.>& ]").ok());
static UUID_FORBIDDEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-]").ok());

const NICE_SWITCHES: &[&str] = &["-n"];
const IONICE_SWITCHES: &[&str] = &["-c", "-n"];

/// Rejects `cmd` if it contains anything but letters, digits, space and
/// `-/.>&`.
pub fn check_cmd_chars(cmd: &str) -> Result<(), UdevRulesError> {
    check_chars("cmd", cmd, &CMD_FORBIDDEN)
}

/// Rejects `uuid` if it is empty or contains anything but letters, digits
/// and `-`.
pub fn check_uuid_chars(uuid: &str) -> Result<(), UdevRulesError> {
    // `ID_FS_UUID==""` would match every device without a filesystem UUID.
    if uuid.is_empty() {
        return Err(UdevRulesError::InvalidChar(
            "Parameter 'uuid' is empty".to_string(),
        ));
    }
    check_chars("uuid", uuid, &UUID_FORBIDDEN)
}

fn check_chars(
    parameter: &str,
    value: &str,
    forbidden: &LazyLock<Option<Regex>>,
) -> Result<(), UdevRulesError> {
    let Some(forbidden) = forbidden.as_ref() else {
        return Err(UdevRulesError::InvalidChar(format!(
            "Parameter '{parameter}' cannot be checked"
        )));
    };
    let mut offending: Vec<&str> = Vec::new();
    for found in forbidden.find_iter(value) {
        if !offending.contains(&found.as_str()) {
            offending.push(found.as_str());
        }
    }
    if offending.is_empty() {
        Ok(())
    } else {
        Err(UdevRulesError::InvalidChar(format!(
            "Parameter '{parameter}' contains invalid character(s) {}",
            offending.join("|")
        )))
    }
}

/// Checks the shape of a command that already passed
/// [`check_cmd_chars`]: an absolute path, no `&&`, optionally wrapped in
/// `nice`/`ionice` with their switches, running the entry point.
pub fn check_cmd_shape(cmd: &str, programs: &Programs) -> Result<(), UdevRulesError> {
    if cmd.contains("&&") {
        return Err(UdevRulesError::InvalidCmd(
            "Parameter 'cmd' contains '&&' concatenation".to_string(),
        ));
    }
    if !cmd.starts_with('/') {
        return Err(UdevRulesError::InvalidCmd(
            "Parameter 'cmd' does not start with '/'".to_string(),
        ));
    }

    let wrappers = [
        (programs.nice.as_str(), NICE_SWITCHES),
        (programs.ionice.as_str(), IONICE_SWITCHES),
    ];
    let mut parts = cmd.split_whitespace().peekable();
    'strip: while let Some(&first) = parts.peek() {
        for (wrapper, switches) in &wrappers {
            if first == *wrapper {
                parts.next();
                while let Some(switch) = parts.next_if(|part| is_switch(switches, part)) {
                    // A bare number is only a value right after a detached
                    // switch; on its own, nice and ionice would run it.
                    if switches.contains(&switch) {
                        parts.next_if(|part| is_number(part));
                    }
                }
                continue 'strip;
            }
        }
        break;
    }

    match parts.next() {
        None => Err(UdevRulesError::InvalidCmd(
            "Parameter 'cmd' does not contain the backintime command".to_string(),
        )),
        Some(program) if program != programs.entry_point => Err(UdevRulesError::InvalidCmd(
            format!("Parameter 'cmd' contains non-whitelisted cmd/parameter ({program})"),
        )),
        Some(_) => Ok(()),
    }
}

fn is_switch(switches: &[&str], part: &str) -> bool {
    switches.iter().any(|switch| part.starts_with(*switch))
}

fn is_number(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit())
}
