use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use crate::errors::ExecError;

/// Ordered argument list plus an optional working directory and environment
/// overlay. Arguments are passed to `execve(2)` as-is, so nothing in here is
/// ever interpreted by a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandVector {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandVector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Builds a command from a complete argv. The first element is the
    /// program and must not be empty.
    pub fn try_from_argv<I, S>(argv: I) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            Some(program) if !program.is_empty() => Ok(Self {
                argv,
                cwd: None,
                env: HashMap::new(),
            }),
            _ => Err(ExecError::EmptyCommand),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(&mut self, cwd: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds a variable on top of the inherited environment.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn get_program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn get_args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_envs(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Space-joined argv for log messages. Not suitable for execution.
    pub fn printable(&self) -> String {
        self.argv.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn try_from_argv_rejects_missing_program() {
        assert!(matches!(
            CommandVector::try_from_argv(Vec::<String>::new()),
            Err(ExecError::EmptyCommand)
        ));
        assert!(matches!(
            CommandVector::try_from_argv(["", "--version"]),
            Err(ExecError::EmptyCommand)
        ));
    }

    #[test]
    fn builder_keeps_argument_order() {
        let mut command = CommandVector::new("rsync");
        command.arg("--recursive").args(["--times", "a b"]);

        assert_eq!(command.get_program(), "rsync");
        assert_eq!(
            command.get_args(),
            &["--recursive".to_string(), "--times".to_string(), "a b".to_string()]
        );
        assert_eq!(command.printable(), "rsync --recursive --times a b");
    }
}
